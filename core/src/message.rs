//! Lifecycle messages and their wire format.
//!
//! Inbound messages drive transitions; [`SignMessage::SignChanged`] is emitted
//! after every committed transition. Every message travels inside an
//! [`Envelope`] that carries the delivery attempt counter used by the requeue
//! policy, and is encoded with bincode into a [`SerializedMessage`].

use crate::ids::{
    OrderId, PartId, ProductItemId, SignEventId, SignId, StockEventId, UserId,
};
use crate::sign::AllocationKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default topic for inbound lifecycle messages.
pub const COMMANDS_TOPIC: &str = "sign-commands";

/// Default topic for `SignChanged` notifications.
pub const EVENTS_TOPIC: &str = "sign-events";

/// Errors encoding or decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Failed to serialize.
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    /// Failed to deserialize.
    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    /// Type tag and payload disagree.
    #[error("Message type mismatch: header says {header}, payload is {payload}")]
    TypeMismatch {
        /// Tag on the wire.
        header: String,
        /// Tag of the decoded payload.
        payload: String,
    },
}

/// Lifecycle messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignMessage {
    /// A pack label was scanned; move the matching sign into `part`.
    PartScanned {
        /// Owner of the scanned sign.
        user: UserId,
        /// Partial code as read from the label.
        fragment: String,
        /// Part to assign.
        part: PartId,
    },

    /// An order line needs a sign reserved.
    OrderReserved {
        /// Order.
        order: OrderId,
        /// Line item.
        product_item: ProductItemId,
        /// Which inventory to allocate from.
        key: AllocationKey,
    },

    /// An order line was fulfilled.
    OrderFulfilled {
        /// Order.
        order: OrderId,
        /// Line item.
        product_item: ProductItemId,
    },

    /// The warehouse received goods that belong to an order.
    StockReceived {
        /// Stock movement id.
        stock_event: StockEventId,
        /// Order the goods came back from.
        order: OrderId,
    },

    /// A document for a sign is available for download.
    DocumentLinked {
        /// Sign.
        sign_id: SignId,
        /// Where to fetch it.
        url: String,
    },

    /// A transition was committed.
    SignChanged {
        /// Sign.
        sign_id: SignId,
        /// New current event.
        event_id: SignEventId,
        /// Superseded event.
        previous: SignEventId,
    },
}

impl SignMessage {
    /// Versioned type tag.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::PartScanned { .. } => "PartScanned.v1",
            Self::OrderReserved { .. } => "OrderReserved.v1",
            Self::OrderFulfilled { .. } => "OrderFulfilled.v1",
            Self::StockReceived { .. } => "StockReceived.v1",
            Self::DocumentLinked { .. } => "DocumentLinked.v1",
            Self::SignChanged { .. } => "SignChanged.v1",
        }
    }
}

/// Delivery wrapper around a [`SignMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable across redeliveries and requeues.
    pub message_id: Uuid,
    /// Zero-based delivery attempt.
    pub attempt: u32,
    /// When the message was first issued.
    pub issued_at: DateTime<Utc>,
    /// Body.
    pub payload: SignMessage,
}

impl Envelope {
    /// Wrap a fresh message.
    #[must_use]
    pub fn new(payload: SignMessage, issued_at: DateTime<Utc>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            attempt: 0,
            issued_at,
            payload,
        }
    }

    /// Same message, next attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Encode for the bus.
    ///
    /// # Errors
    ///
    /// [`MessageError::SerializationError`] if bincode fails.
    pub fn encode(&self) -> Result<SerializedMessage, MessageError> {
        let data =
            bincode::serialize(self).map_err(|e| MessageError::SerializationError(e.to_string()))?;
        Ok(SerializedMessage::new(
            self.payload.message_type().to_string(),
            data,
        ))
    }

    /// Decode from the bus.
    ///
    /// # Errors
    ///
    /// [`MessageError::DeserializationError`] for undecodable bytes,
    /// [`MessageError::TypeMismatch`] if the tag disagrees with the payload.
    pub fn decode(message: &SerializedMessage) -> Result<Self, MessageError> {
        let envelope: Self = bincode::deserialize(&message.data)
            .map_err(|e| MessageError::DeserializationError(e.to_string()))?;
        let payload_type = envelope.payload.message_type();
        if payload_type != message.message_type {
            return Err(MessageError::TypeMismatch {
                header: message.message_type.clone(),
                payload: payload_type.to_string(),
            });
        }
        Ok(envelope)
    }
}

/// Encoded message as carried by a [`MessageBus`](crate::bus::MessageBus).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMessage {
    /// Versioned type tag, readable without decoding `data`.
    pub message_type: String,
    /// bincode-encoded [`Envelope`].
    pub data: Vec<u8>,
}

impl SerializedMessage {
    /// Create a serialized message.
    #[must_use]
    pub const fn new(message_type: String, data: Vec<u8>) -> Self {
        Self { message_type, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fulfilled() -> Envelope {
        Envelope::new(
            SignMessage::OrderFulfilled {
                order: OrderId::new(),
                product_item: ProductItemId::new(),
            },
            Utc::now(),
        )
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
    fn envelope_survives_the_wire() {
        let envelope = fulfilled().next_attempt();
        let wire = envelope.encode().expect("encode");
        assert_eq!(wire.message_type, "OrderFulfilled.v1");

        let decoded = Envelope::decode(&wire).expect("decode");
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.attempt, 1);
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
    fn mismatched_tag_is_rejected() {
        let mut wire = fulfilled().encode().expect("encode");
        wire.message_type = "PartScanned.v1".to_string();
        assert!(matches!(
            Envelope::decode(&wire),
            Err(MessageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let wire = SerializedMessage::new("OrderFulfilled.v1".to_string(), vec![0xff; 3]);
        assert!(matches!(
            Envelope::decode(&wire),
            Err(MessageError::DeserializationError(_))
        ));
    }

    #[test]
    fn retries_keep_identity() {
        let first = fulfilled();
        let second = first.next_attempt().next_attempt();
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.attempt, 2);
    }
}
