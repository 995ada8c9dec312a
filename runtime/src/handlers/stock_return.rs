use super::{DEFAULT_RETRY_DELAY, HandlerError, Outcome, release};
use crate::dedup::{Deduplicator, STOCK_RETURN_NAMESPACE};
use crate::engine::TransitionEngine;
use marksign_core::SignError;
use marksign_core::ids::{OrderId, StockEventId};
use marksign_core::sign::{SignEvent, SignQuery};
use marksign_core::status::SignStatus;
use marksign_core::transition::SignCommand;
use std::sync::Arc;
use std::time::Duration;

/// Returns the signs of an order to stock when its goods come back.
///
/// Guarded per stock movement so a replayed warehouse event does not cancel
/// twice.
#[derive(Clone)]
pub struct StockReturnResolver {
    engine: Arc<TransitionEngine>,
    dedup: Deduplicator,
    retry_delay: Duration,
}

impl StockReturnResolver {
    /// Resolver over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<TransitionEngine>, dedup: Deduplicator) -> Self {
        Self {
            engine,
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

    /// Handle a `StockReceived` message.
    ///
    /// # Errors
    ///
    /// Validation or storage failures; the guard is released first.
    pub async fn handle(
        &self,
        stock_event: StockEventId,
        order: OrderId,
    ) -> Result<Outcome, HandlerError> {
        let guard = self
            .dedup
            .namespace(STOCK_RETURN_NAMESPACE)
            .deduplicate(&[stock_event.to_string(), order.to_string()]);
        if guard.is_executed().await? {
            return Ok(Outcome::Duplicate);
        }

        let done = SignQuery::by_order(order).with_status(SignStatus::Done);
        let events = match self.engine.store().query(done).await {
            Ok(events) => events,
            Err(e) => {
                release(&guard).await;
                return Err(e.into());
            },
        };

        let mut returned = 0usize;
        for event in events {
            match self.cancel(&event, order).await {
                Ok(true) => returned += 1,
                Ok(false) => {},
                Err(e) if e.is_retryable() => {
                    release(&guard).await;
                    return Ok(Outcome::retry(self.retry_delay, e.to_string()));
                },
                Err(e) => {
                    release(&guard).await;
                    return Err(e.into());
                },
            }
        }

        guard.mark_done().await?;
        tracing::info!(%stock_event, %order, returned, "Order signs returned to stock");
        Ok(Outcome::Completed)
    }

    /// Cancel one sign, re-reading once if it moved. `Ok(false)` means it is no
    /// longer a `Done` sign of this order.
    async fn cancel(&self, event: &SignEvent, order: OrderId) -> Result<bool, SignError> {
        match self.engine.apply_transition(event.id, SignCommand::cancel()).await {
            Ok(_) => Ok(true),
            Err(SignError::Conflict { .. }) => {
                let current = self
                    .engine
                    .store()
                    .current_event(event.sign_id)
                    .await
                    .map_err(|e| SignError::Storage(e.to_string()))?;
                match current {
                    Some(current)
                        if current.status == SignStatus::Done && current.order == Some(order) =>
                    {
                        self.engine
                            .apply_transition(current.id, SignCommand::cancel())
                            .await
                            .map(|_| true)
                    },
                    _ => Ok(false),
                }
            },
            Err(e) => Err(e),
        }
    }
}
