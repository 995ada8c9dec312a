//! Idempotency guards for message side effects.
//!
//! A handler derives a key from the message fields that identify its side
//! effect, asks whether that effect already ran, and marks it done once the
//! effect committed. If the effect could not be performed the guard is
//! deleted so a redelivery can try again.
//!
//! ```
//! use marksign_runtime::dedup::Deduplicator;
//! use marksign_testing::InMemoryDedupStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let dedup = Deduplicator::new(Arc::new(InMemoryDedupStore::new()));
//! let guard = dedup.namespace("sign-part").deduplicate(&["ABC", "part-1"]);
//!
//! assert!(!guard.is_executed().await.unwrap());
//! guard.mark_done().await.unwrap();
//!
//! let again = dedup.namespace("sign-part").deduplicate(&["ABC", "part-1"]);
//! assert!(again.is_executed().await.unwrap());
//! # });
//! ```

use crate::metrics::DedupMetrics;
use marksign_core::StoreError;
use marksign_core::dedup::{DedupKey, DedupStore};
use std::sync::Arc;
use std::time::Duration;

/// Assigning a scanned label to a part.
pub const PART_NAMESPACE: &str = "sign-part";
/// The scan itself; deleted once its part assignment lands.
pub const SCAN_NAMESPACE: &str = "sign-scan";
/// Reserving a sign for an order line.
pub const RESERVE_NAMESPACE: &str = "sign-reserve";
/// Returning an order's signs to stock.
pub const STOCK_RETURN_NAMESPACE: &str = "sign-stock-return";
/// Attaching a fetched document.
pub const DOCUMENT_NAMESPACE: &str = "sign-document";

/// How long a claim blocks other deliveries before it may be taken over.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Entry point for building guards.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn DedupStore>,
    lease: Duration,
}

impl Deduplicator {
    /// Guards backed by `store` with the default lease.
    #[must_use]
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self {
            store,
            lease: DEFAULT_LEASE,
        }
    }

    /// Override the claim lease.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Guards in `namespace`.
    #[must_use]
    pub fn namespace(&self, namespace: &'static str) -> DedupNamespace<'_> {
        DedupNamespace {
            dedup: self,
            namespace,
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DedupStore> {
        &self.store
    }
}

/// A [`Deduplicator`] scoped to one namespace.
pub struct DedupNamespace<'a> {
    dedup: &'a Deduplicator,
    namespace: &'static str,
}

impl DedupNamespace<'_> {
    /// Guard for the effect identified by `tokens`, in order.
    #[must_use]
    pub fn deduplicate<T: AsRef<str>>(&self, tokens: &[T]) -> DedupGuard {
        DedupGuard {
            store: Arc::clone(&self.dedup.store),
            key: DedupKey::new(self.namespace, tokens),
            lease: self.dedup.lease,
        }
    }
}

/// Guard over one side effect.
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
    key: DedupKey,
    lease: Duration,
}

impl DedupGuard {
    /// Whether the effect already ran or is running elsewhere.
    ///
    /// Returns `false` to exactly one concurrent caller, which now owns the
    /// claim and must either [`mark_done`](Self::mark_done) or
    /// [`delete`](Self::delete).
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn is_executed(&self) -> Result<bool, StoreError> {
        let claimed = self.store.claim(self.key.clone(), self.lease).await?;
        if !claimed {
            DedupMetrics::record_duplicate(self.key.namespace());
            tracing::debug!(key = %self.key, "Duplicate delivery");
        }
        Ok(!claimed)
    }

    /// Record the effect as executed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn mark_done(&self) -> Result<(), StoreError> {
        self.store.mark_done(self.key.clone()).await
    }

    /// Forget the key so the effect may run again.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn delete(&self) -> Result<(), StoreError> {
        self.store.release(self.key.clone()).await
    }

    /// Key.
    #[must_use]
    pub const fn key(&self) -> &DedupKey {
        &self.key
    }
}
