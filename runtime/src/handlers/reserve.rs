use super::{DEFAULT_RETRY_DELAY, HandlerError, Outcome, release};
use crate::allocator::{Allocation, Allocator};
use crate::dedup::{Deduplicator, RESERVE_NAMESPACE};
use marksign_core::ids::{OrderId, PartId, ProductItemId};
use marksign_core::sign::{AllocationKey, SignQuery};
use marksign_core::status::SignStatus;
use marksign_core::transition::SignCommand;
use std::time::Duration;

/// Reserves a free sign for an order line.
///
/// Shortage is reported and dropped: inventory does not appear by waiting.
#[derive(Clone)]
pub struct ReserveResolver {
    allocator: Allocator,
    dedup: Deduplicator,
    retry_delay: Duration,
}

impl ReserveResolver {
    /// Resolver allocating through `allocator`.
    #[must_use]
    pub const fn new(allocator: Allocator, dedup: Deduplicator) -> Self {
        Self {
            allocator,
            dedup,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Handle an `OrderReserved` message.
    ///
    /// # Errors
    ///
    /// Validation or storage failures.
    pub async fn handle(
        &self,
        order: OrderId,
        product_item: ProductItemId,
        key: AllocationKey,
    ) -> Result<Outcome, HandlerError> {
        let guard = self
            .dedup
            .namespace(RESERVE_NAMESPACE)
            .deduplicate(&[order.to_string(), product_item.to_string()]);
        if guard.is_executed().await? {
            return Ok(Outcome::Duplicate);
        }

        let line = SignQuery::by_order(order)
            .for_product_item(product_item)
            .with_status(SignStatus::Process)
            .with_status(SignStatus::Done);
        let existing = match self.allocator.engine().store().query(line).await {
            Ok(existing) => existing,
            Err(e) => {
                release(&guard).await;
                return Err(e.into());
            },
        };
        if let Some(reserved) = existing.first() {
            tracing::debug!(sign_id = %reserved.sign_id, %order, "Order line already reserved");
            guard.mark_done().await?;
            return Ok(Outcome::Duplicate);
        }

        let command = SignCommand::process(order, product_item, PartId::new());
        match self.allocator.allocate_one(key, command).await {
            Ok(Allocation::Allocated(event)) => {
                guard.mark_done().await?;
                tracing::info!(sign_id = %event.sign_id, %order, %product_item, "Sign reserved");
                Ok(Outcome::Completed)
            },
            Ok(Allocation::NotAvailable) => {
                release(&guard).await;
                tracing::warn!(%order, %product_item, user = %key.user, "No free sign to reserve");
                Ok(Outcome::dropped("no free sign for the product"))
            },
            Err(e) if e.is_retryable() => {
                release(&guard).await;
                Ok(Outcome::retry(self.retry_delay, e.to_string()))
            },
            Err(e) => {
                release(&guard).await;
                Err(e.into())
            },
        }
    }
}
