use super::{DEFAULT_RETRY_DELAY, HandlerError, Outcome};
use crate::engine::TransitionEngine;
use marksign_core::ids::{OrderId, ProductItemId};
use marksign_core::sign::SignQuery;
use marksign_core::status::SignStatus;
use marksign_core::transition::SignCommand;
use std::sync::Arc;
use std::time::Duration;

/// Marks the reserved sign of a fulfilled order line as `Done`.
///
/// A fulfilled line without a reserved sign means the records disagree with
/// the order; that is reported as fatal, never retried.
#[derive(Clone)]
pub struct FulfillmentResolver {
    engine: Arc<TransitionEngine>,
    retry_delay: Duration,
}

impl FulfillmentResolver {
    /// Resolver over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<TransitionEngine>) -> Self {
        Self {
            engine,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Handle an `OrderFulfilled` message.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Inconsistent`] when no sign is reserved for the line;
    /// validation or storage failures.
    pub async fn handle(
        &self,
        order: OrderId,
        product_item: ProductItemId,
    ) -> Result<Outcome, HandlerError> {
        let line = SignQuery::by_order(order)
            .for_product_item(product_item)
            .with_status(SignStatus::Process)
            .with_status(SignStatus::Done);
        let events = self.engine.store().query(line).await?;

        if events.is_empty() {
            tracing::error!(%order, %product_item, "Fulfilled order line has no reserved sign");
            return Err(HandlerError::Inconsistent(format!(
                "no sign reserved for order {order} item {product_item}"
            )));
        }

        let batch: Vec<_> = events
            .iter()
            .filter(|e| e.status == SignStatus::Process)
            .map(|e| (e.id, SignCommand::done()))
            .collect();
        if batch.is_empty() {
            return Ok(Outcome::Duplicate);
        }

        match self.engine.apply_batch(batch).await {
            Ok(done) => {
                tracing::info!(%order, %product_item, count = done.len(), "Order line fulfilled");
                Ok(Outcome::Completed)
            },
            Err(e) if e.is_retryable() => Ok(Outcome::retry(self.retry_delay, e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
