//! Sign record storage.
//!
//! [`SignStore`] is the single seam between the lifecycle logic and
//! persistence. It provides the two points of true mutual exclusion the
//! lifecycle needs:
//!
//! - a uniqueness constraint on the code identity, GTIN plus serial ([`SignStore::insert`])
//! - a compare-and-swap on each sign's current-event pointer ([`SignStore::commit`])
//!
//! Allocation additionally needs free signs handed out exclusively, which
//! [`SignStore::claim_new`] does by selecting and committing in one unit of
//! work that skips signs another claim holds. Everything else is optimistic.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so stores can be shared as
//! `Arc<dyn SignStore>`. Arguments are owned so implementations need not
//! borrow across await points.

use crate::error::StoreError;
use crate::ids::{SignEventId, SignId, UserId};
use crate::sign::{AllocationKey, CodeArtifact, Sign, SignEvent, SignQuery};
use crate::transition::{SignCommand, Transition, plan};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Request to move free signs out of `New`.
#[derive(Clone, Debug)]
pub struct NewClaim {
    /// Which signs are eligible.
    pub key: AllocationKey,
    /// How many to claim, all or none.
    pub quantity: usize,
    /// Applied to every claimed sign.
    pub command: SignCommand,
    /// Timestamp of the new events.
    pub now: DateTime<Utc>,
}

/// Result of [`SignStore::claim_new`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// Committed transitions, oldest sign first.
    Claimed(Vec<Transition>),
    /// Fewer free signs than requested; nothing was written.
    Short {
        /// Free signs found.
        available: usize,
    },
}

impl NewClaim {
    /// Plan the claim over `candidates`, which must all be current `New` events.
    ///
    /// # Errors
    ///
    /// [`StoreError::Rejected`] if the command is not legal from a candidate.
    pub fn plan(&self, candidates: &[SignEvent]) -> Result<Vec<Transition>, StoreError> {
        candidates
            .iter()
            .map(|current| {
                plan(current, self.command.clone(), SignEventId::new(), self.now)
                    .map_err(StoreError::Rejected)
            })
            .collect()
    }
}

/// Durable storage of signs and their event history.
pub trait SignStore: Send + Sync {
    /// Insert a new sign with its first event.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateCode`] if a code with the same GTIN and serial is already registered.
    fn insert(&self, sign: Sign, event: SignEvent) -> StoreFuture<'_, ()>;

    /// Load a sign by id.
    ///
    /// # Errors
    ///
    /// Database failures only; absence is `Ok(None)`.
    fn load_sign(&self, id: SignId) -> StoreFuture<'_, Option<Sign>>;

    /// Load any event version by id, current or not.
    ///
    /// # Errors
    ///
    /// Database failures only; absence is `Ok(None)`.
    fn load_event(&self, id: SignEventId) -> StoreFuture<'_, Option<SignEvent>>;

    /// Load the current event of a sign.
    ///
    /// # Errors
    ///
    /// Database failures only; absence is `Ok(None)`.
    fn current_event(&self, id: SignId) -> StoreFuture<'_, Option<SignEvent>>;

    /// All versions of a sign, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures only.
    fn history(&self, id: SignId) -> StoreFuture<'_, Vec<SignEvent>>;

    /// Apply transitions as one unit of work.
    ///
    /// For every transition the sign's current pointer must still equal
    /// `expected`; the new event is appended and the pointer moved. When
    /// `cancel_previous` is set the superseded event is flagged cancelled.
    /// Either all transitions apply or none do.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if a sign is unknown
    /// - [`StoreError::Conflict`] if a pointer moved
    fn commit(&self, transitions: Vec<Transition>) -> StoreFuture<'_, ()>;

    /// Current `New` events matching `key`, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures only.
    fn find_new(&self, key: AllocationKey, limit: usize) -> StoreFuture<'_, Vec<SignEvent>>;

    /// Claim the `quantity` oldest free signs matching `key` and apply the
    /// claim's command to them as one unit of work.
    ///
    /// Signs already held by a concurrent claim or commit are skipped rather
    /// than waited for, so concurrent claimants always receive disjoint signs
    /// and none of them fails while unclaimed free signs remain.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Rejected`] if the command is not legal from `New`
    /// - database failures
    fn claim_new(&self, claim: NewClaim) -> StoreFuture<'_, Claim>;

    /// Current events matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures only.
    fn query(&self, query: SignQuery) -> StoreFuture<'_, Vec<SignEvent>>;

    /// Current event of the newest sign of `user` whose code contains `fragment`.
    ///
    /// # Errors
    ///
    /// Database failures only; no match is `Ok(None)`.
    fn find_by_code_fragment(
        &self,
        user: UserId,
        fragment: String,
    ) -> StoreFuture<'_, Option<SignEvent>>;

    /// Whether `user` already owns `code` (canonical form).
    ///
    /// # Errors
    ///
    /// Database failures only.
    fn code_exists(&self, user: UserId, code: String) -> StoreFuture<'_, bool>;

    /// Record the rendered artifact of a sign's code.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the sign is unknown.
    fn attach_artifact(&self, id: SignId, artifact: CodeArtifact) -> StoreFuture<'_, ()>;
}
