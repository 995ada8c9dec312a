//! Deduplication keys and storage.
//!
//! A key is a stable hash over a namespace and an ordered list of tokens. The
//! store records, per key, whether the guarded side effect was executed.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const SEPARATOR: u8 = 0x1f;

/// Boxed future returned by dedup operations.
pub type DedupFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// `(namespace, sha256(namespace, tokens))`.
///
/// # Examples
///
/// ```
/// use marksign_core::dedup::DedupKey;
///
/// let a = DedupKey::new("sign-part", &["ABC", "part-1"]);
/// let b = DedupKey::new("sign-part", &["ABC", "part-1"]);
/// let c = DedupKey::new("sign-part", &["ABCp", "art-1"]);
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(a.hash().len(), 64);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    namespace: String,
    hash: String,
}

impl DedupKey {
    /// Hash `tokens` under `namespace`.
    #[must_use]
    pub fn new<T: AsRef<str>>(namespace: &str, tokens: &[T]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        for token in tokens {
            hasher.update([SEPARATOR]);
            hasher.update(token.as_ref().as_bytes());
        }
        Self {
            namespace: namespace.to_string(),
            hash: hex::encode(hasher.finalize()),
        }
    }

    /// Namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hex-encoded digest.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, &self.hash[..12.min(self.hash.len())])
    }
}

/// Persistent record of executed side effects.
pub trait DedupStore: Send + Sync {
    /// Atomically claim `key`.
    ///
    /// Returns `true` for exactly one caller: the first claimant, or the next
    /// one after an unfinished claim's `lease` expired. Returns `false` when
    /// the key is executed or another claim is live.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn claim(&self, key: DedupKey, lease: Duration) -> DedupFuture<'_, bool>;

    /// Mark `key` executed.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn mark_done(&self, key: DedupKey) -> DedupFuture<'_, ()>;

    /// Forget `key` entirely so the effect may run again.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn release(&self, key: DedupKey) -> DedupFuture<'_, ()>;

    /// Remove executed keys completed before `cutoff`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn purge_executed_before(&self, cutoff: DateTime<Utc>) -> DedupFuture<'_, u64>;
}
