//! Message dispatcher.
//!
//! Consumes envelopes from the bus, routes them to [`Handlers`], and settles
//! each one:
//!
//! - `Completed`, `Duplicate`, `Dropped`: acknowledged
//! - `Retry`: dispatched again with `attempt + 1` after the handler's delay,
//!   until the [`RequeuePolicy`] budget runs out, then parked
//! - [`HandlerError`](crate::handlers::HandlerError) or an undecodable
//!   payload: parked immediately

use crate::handlers::{Handlers, Outcome};
use crate::metrics::{BusMetrics, HandlerMetrics};
use crate::retry::{Requeue, RequeuePolicy};
use futures::StreamExt;
use marksign_core::StoreError;
use marksign_core::bus::{BusError, MessageBus};
use marksign_core::dead_letter::{DeadLetter, DeadLetterSink};
use marksign_core::environment::Clock;
use marksign_core::message::{COMMANDS_TOPIC, Envelope, SerializedMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Dispatcher settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Topic consumed, and re-dispatched to on retry.
    pub topic: String,
    /// Messages handled at once.
    pub concurrency: usize,
    /// Delivery budget for retried messages.
    pub requeue: RequeuePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topic: COMMANDS_TOPIC.to_string(),
            concurrency: 8,
            requeue: RequeuePolicy::default(),
        }
    }
}

/// How a message was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Handler performed its side effect.
    Completed,
    /// Already handled.
    Duplicate,
    /// Acknowledged without effect.
    Dropped,
    /// Scheduled for another delivery.
    Requeued {
        /// Attempt number of the scheduled delivery.
        attempt: u32,
        /// Delay requested.
        delay: Duration,
    },
    /// Parked in the dead-letter sink.
    DeadLettered,
}

/// Routes bus messages to handlers.
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    handlers: Arc<Handlers>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Dispatcher with default settings.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        handlers: Arc<Handlers>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bus,
            handlers,
            dead_letters,
            clock,
            config: DispatcherConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Consume the topic until the subscription ends.
    ///
    /// # Errors
    ///
    /// [`BusError`] if the subscription cannot be opened.
    pub async fn run(&self) -> Result<(), BusError> {
        let stream = self.bus.subscribe(&[self.config.topic.as_str()]).await?;
        tracing::info!(
            topic = %self.config.topic,
            concurrency = self.config.concurrency,
            "Dispatcher started"
        );

        stream
            .for_each_concurrent(self.config.concurrency, |item| async move {
                match item {
                    Ok(message) => {
                        if let Err(e) = self.process(message).await {
                            tracing::error!(error = %e, "Failed to park message");
                        }
                    },
                    Err(e) => tracing::warn!(error = %e, "Bus delivered an error"),
                }
            })
            .await;

        tracing::info!(topic = %self.config.topic, "Dispatcher stopped");
        Ok(())
    }

    /// Handle and settle one message.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if a message that had to be parked could not be.
    pub async fn process(&self, message: SerializedMessage) -> Result<Disposition, StoreError> {
        let envelope = match Envelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(message_type = %message.message_type, error = %e, "Undecodable message");
                self.park(message, None, e.to_string(), 1).await?;
                return Ok(Disposition::DeadLettered);
            },
        };

        let message_type = envelope.payload.message_type();
        let span = tracing::info_span!(
            "handle_message",
            message_id = %envelope.message_id,
            message_type,
            attempt = envelope.attempt
        );
        let started = Instant::now();
        let result = self.handlers.route(&envelope).instrument(span).await;
        let deliveries = envelope.attempt.saturating_add(1);

        match result {
            Ok(outcome) => {
                HandlerMetrics::record_outcome(message_type, outcome.label(), started.elapsed());
                match outcome {
                    Outcome::Completed => Ok(Disposition::Completed),
                    Outcome::Duplicate => Ok(Disposition::Duplicate),
                    Outcome::Dropped { reason } => {
                        tracing::warn!(message_id = %envelope.message_id, message_type, %reason, "Message dropped");
                        Ok(Disposition::Dropped)
                    },
                    Outcome::Retry { delay, reason } => {
                        match self.config.requeue.decide(envelope.attempt, delay) {
                            Requeue::After(delay) => self.requeue(&envelope, message, delay, &reason).await,
                            Requeue::DeadLetter => {
                                tracing::error!(
                                    message_id = %envelope.message_id,
                                    message_type,
                                    attempts = deliveries,
                                    %reason,
                                    "Retry budget exhausted"
                                );
                                let error = format!("retry budget exhausted: {reason}");
                                self.park(message, Some(envelope.message_id), error, deliveries)
                                    .await?;
                                Ok(Disposition::DeadLettered)
                            },
                        }
                    },
                }
            },
            Err(e) => {
                HandlerMetrics::record_outcome(message_type, "failed", started.elapsed());
                tracing::error!(message_id = %envelope.message_id, message_type, error = %e, "Handler failed");
                self.park(message, Some(envelope.message_id), e.to_string(), deliveries)
                    .await?;
                Ok(Disposition::DeadLettered)
            },
        }
    }

    async fn requeue(
        &self,
        envelope: &Envelope,
        message: SerializedMessage,
        delay: Duration,
        reason: &str,
    ) -> Result<Disposition, StoreError> {
        let next = envelope.next_attempt();
        let dispatched = match next.encode() {
            Ok(wire) => self
                .bus
                .dispatch(&self.config.topic, &wire, Some(delay))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match dispatched {
            Ok(()) => {
                BusMetrics::record_requeue();
                tracing::info!(
                    message_id = %envelope.message_id,
                    attempt = next.attempt,
                    delay_secs = delay.as_secs(),
                    %reason,
                    "Message requeued"
                );
                Ok(Disposition::Requeued {
                    attempt: next.attempt,
                    delay,
                })
            },
            Err(e) => {
                tracing::error!(message_id = %envelope.message_id, error = %e, "Requeue failed");
                let error = format!("requeue failed: {e}");
                self.park(message, Some(envelope.message_id), error, next.attempt)
                    .await?;
                Ok(Disposition::DeadLettered)
            },
        }
    }

    async fn park(
        &self,
        message: SerializedMessage,
        message_id: Option<Uuid>,
        error_message: String,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.dead_letters
            .park(DeadLetter {
                topic: self.config.topic.clone(),
                message,
                message_id,
                error_message,
                attempts,
                failed_at: self.clock.now(),
            })
            .await
    }
}
