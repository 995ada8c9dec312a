//! Dead letters.
//!
//! A message that exhausted its retry budget, failed fatally, or could not be
//! decoded is parked instead of being requeued forever.

use crate::error::StoreError;
use crate::message::SerializedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// A parked message with failure context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the message was consumed from.
    pub topic: String,
    /// Message as received.
    pub message: SerializedMessage,
    /// Envelope id, when the payload could be decoded.
    pub message_id: Option<Uuid>,
    /// Last error.
    pub error_message: String,
    /// Delivery attempts made.
    pub attempts: u32,
    /// When it was parked.
    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Park a message.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
