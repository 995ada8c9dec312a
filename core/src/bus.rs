//! Message bus abstraction.
//!
//! The bus carries inbound lifecycle messages to the dispatcher and
//! `SignChanged` notifications to downstream collaborators.
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: messages may be delivered more than once
//! - **Idempotency**: handlers guard their side effects with a dedup key
//! - **Delayed dispatch**: a message may be scheduled for later delivery;
//!   this is how handler retries are expressed (no in-process timers)
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` in `marksign-testing`
//! - `RedpandaMessageBus` in `marksign-redpanda`

use crate::message::SerializedMessage;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to dispatch a message to a topic
    #[error("Dispatch failed for topic '{topic}': {reason}")]
    DispatchFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize a message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<SerializedMessage, BusError>> + Send>>;

/// Publish/subscribe transport.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn MessageBus>`. Implementations copy borrowed arguments before
/// building the returned future.
pub trait MessageBus: Send + Sync {
    /// Dispatch a message to a topic, optionally after `delay`.
    ///
    /// With a delay, `Ok` means the message was scheduled, not yet delivered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DispatchFailed`] if the message could not be
    /// handed to the transport.
    fn dispatch(
        &self,
        topic: &str,
        message: &SerializedMessage,
        delay: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>>;
}
