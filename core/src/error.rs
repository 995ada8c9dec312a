//! Error taxonomies for storage and the transition engine.

use crate::ids::{SignEventId, SignId};
use crate::transition::Violation;
use thiserror::Error;
use uuid::Uuid;

/// Errors from a [`SignStore`](crate::store::SignStore) or
/// [`DedupStore`](crate::dedup::DedupStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The code is already registered.
    #[error("Code already registered: {0}")]
    DuplicateCode(String),

    /// The sign's current event moved since it was read.
    #[error("Concurrency conflict for sign {sign_id}: expected {expected}, found {actual:?}")]
    Conflict {
        /// Sign whose pointer moved.
        sign_id: SignId,
        /// Event the caller believed current.
        expected: SignEventId,
        /// Event actually current, when known.
        actual: Option<SignEventId>,
    },

    /// The planner refused a transition the store was asked to plan.
    #[error("Transition rejected: {0}")]
    Rejected(Violation),

    /// Referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database-level failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Encoding or decoding of a stored record failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the transition engine and allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    /// The command or registration was rejected; nothing was written.
    #[error("Validation failed [{correlation_id}]: {violation}")]
    ValidationFailed {
        /// Id attached to the log span of the failed call.
        correlation_id: Uuid,
        /// What was wrong.
        violation: Violation,
    },

    /// Sign or event unknown. Re-read and retry.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Someone else transitioned the sign first.
    #[error("Sign {sign_id} moved past event {expected}")]
    Conflict {
        /// Sign.
        sign_id: SignId,
        /// Event the caller named.
        expected: SignEventId,
    },

    /// Persistence failure.
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl SignError {
    /// Map a storage error for the call identified by `correlation_id`.
    #[must_use]
    pub fn from_store(error: StoreError, correlation_id: Uuid) -> Self {
        match error {
            StoreError::DuplicateCode(code) => Self::ValidationFailed {
                correlation_id,
                violation: Violation::DuplicateCode(code),
            },
            StoreError::Conflict {
                sign_id, expected, ..
            } => Self::Conflict { sign_id, expected },
            StoreError::Rejected(violation) => Self::ValidationFailed {
                correlation_id,
                violation,
            },
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Database(message) | StoreError::Serialization(message) => {
                Self::Storage(message)
            },
        }
    }

    /// Conflicts and missing records may resolve on a re-read.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }
}
