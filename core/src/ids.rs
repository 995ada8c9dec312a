//! Strongly typed identifiers.
//!
//! Every entity the sign lifecycle touches is addressed by a UUID newtype so that
//! an order id can never be passed where a product item id is expected.
//!
//! # Validation
//!
//! - `FromStr::from_str()`: Validates input (must be a UUID)
//! - `from_uuid()` and `new()`: No validation (for internal use with trusted input)
//!
//! # Examples
//!
//! ```
//! use marksign_core::ids::{OrderId, SignId};
//!
//! let sign = SignId::new();
//! let parsed: SignId = sign.to_string().parse().unwrap();
//! assert_eq!(sign, parsed);
//!
//! assert!("not-a-uuid".parse::<OrderId>().is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind} identifier: {value}")]
pub struct ParseIdError {
    kind: &'static str,
    value: String,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Whether this is the nil UUID (never a valid reference).
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|_| ParseIdError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Stable identity of a sign across all of its event versions.
    SignId,
    "sign"
);
uuid_id!(
    /// Identity of one immutable event version of a sign.
    ///
    /// Doubles as the optimistic-concurrency token: a command names the event it
    /// believes is current.
    SignEventId,
    "sign event"
);
uuid_id!(
    /// Owner account of a sign.
    UserId,
    "user"
);
uuid_id!(
    /// Owning (or selling) profile.
    ProfileId,
    "profile"
);
uuid_id!(
    /// Catalogue product.
    ProductId,
    "product"
);
uuid_id!(
    /// Product offer (e.g. colour).
    OfferId,
    "offer"
);
uuid_id!(
    /// Product variation (e.g. size).
    VariationId,
    "variation"
);
uuid_id!(
    /// Product modification.
    ModificationId,
    "modification"
);
uuid_id!(
    /// Customer order.
    OrderId,
    "order"
);
uuid_id!(
    /// Line-item constant inside an order the sign is tied to.
    ProductItemId,
    "product item"
);
uuid_id!(
    /// Grouping token shared by every sign of one batch operation.
    PartId,
    "part"
);
uuid_id!(
    /// Warehouse stock movement that triggered a return.
    StockEventId,
    "stock event"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let id = PartId::new();
        let parsed: PartId = id.to_string().parse().unwrap_or_default();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_error_names_the_kind() {
        let err = "xyz".parse::<OrderId>().err();
        let message = err.map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("order"));
        assert!(message.contains("xyz"));
    }

    #[test]
    fn nil_is_detected() {
        assert!(UserId::from_uuid(Uuid::nil()).is_nil());
        assert!(!UserId::new().is_nil());
    }
}
