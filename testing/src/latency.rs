//! Latency injection for concurrency tests.
//!
//! [`LatencySignStore`] delays every read and write of the store it wraps,
//! widening the window between a caller's read and its commit the way a
//! real database round trip does.

use marksign_core::ids::{SignEventId, SignId, UserId};
use marksign_core::sign::{AllocationKey, CodeArtifact, Sign, SignEvent, SignQuery};
use marksign_core::store::{Claim, NewClaim, SignStore, StoreFuture};
use marksign_core::transition::Transition;
use std::sync::Arc;
use std::time::Duration;

/// [`SignStore`] that sleeps before delegating each call.
#[derive(Clone)]
pub struct LatencySignStore {
    inner: Arc<dyn SignStore>,
    latency: Duration,
}

impl LatencySignStore {
    /// Wrap `inner`, delaying each call by `latency`.
    #[must_use]
    pub fn new(inner: Arc<dyn SignStore>, latency: Duration) -> Self {
        Self { inner, latency }
    }

    async fn pause(&self) {
        tokio::time::sleep(self.latency).await;
    }
}

impl SignStore for LatencySignStore {
    fn insert(&self, sign: Sign, event: SignEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pause().await;
            self.inner.insert(sign, event).await
        })
    }

    fn load_sign(&self, id: SignId) -> StoreFuture<'_, Option<Sign>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.load_sign(id).await
        })
    }

    fn load_event(&self, id: SignEventId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.load_event(id).await
        })
    }

    fn current_event(&self, id: SignId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.current_event(id).await
        })
    }

    fn history(&self, id: SignId) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.history(id).await
        })
    }

    fn commit(&self, transitions: Vec<Transition>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pause().await;
            self.inner.commit(transitions).await
        })
    }

    fn find_new(&self, key: AllocationKey, limit: usize) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.find_new(key, limit).await
        })
    }

    fn claim_new(&self, claim: NewClaim) -> StoreFuture<'_, Claim> {
        Box::pin(async move {
            self.pause().await;
            self.inner.claim_new(claim).await
        })
    }

    fn query(&self, query: SignQuery) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.query(query).await
        })
    }

    fn find_by_code_fragment(
        &self,
        user: UserId,
        fragment: String,
    ) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            self.pause().await;
            self.inner.find_by_code_fragment(user, fragment).await
        })
    }

    fn code_exists(&self, user: UserId, code: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.pause().await;
            self.inner.code_exists(user, code).await
        })
    }

    fn attach_artifact(&self, id: SignId, artifact: CodeArtifact) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pause().await;
            self.inner.attach_artifact(id, artifact).await
        })
    }
}
