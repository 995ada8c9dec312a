//! In-memory storage for fast, deterministic tests.
//!
//! - [`InMemorySignStore`]: `HashMap`-backed [`SignStore`] with the same
//!   compare-and-swap and unique-code semantics as the Postgres store
//! - [`InMemoryDedupStore`]: `HashMap`-backed [`DedupStore`]

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use chrono::{DateTime, Utc};
use marksign_core::dedup::{DedupFuture, DedupKey, DedupStore};
use marksign_core::error::StoreError;
use marksign_core::ids::{SignEventId, SignId, UserId};
use marksign_core::sign::{AllocationKey, CodeArtifact, Sign, SignEvent, SignQuery};
use marksign_core::store::{Claim, NewClaim, SignStore, StoreFuture};
use marksign_core::transition::Transition;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct SignState {
    signs: HashMap<SignId, Sign>,
    events: HashMap<SignEventId, SignEvent>,
    history: HashMap<SignId, Vec<SignEventId>>,
    // Code identities (GTIN + serial).
    codes: HashSet<String>,
    // Registration order, oldest first.
    order: Vec<SignId>,
}

impl SignState {
    fn current(&self, id: SignId) -> Option<&SignEvent> {
        self.signs
            .get(&id)
            .and_then(|sign| self.events.get(&sign.current_event))
    }

    fn current_events(&self) -> impl Iterator<Item = &SignEvent> {
        self.order.iter().filter_map(|id| self.current(*id))
    }

    /// Check every pointer before moving any.
    fn validate(&self, transitions: &[Transition]) -> Result<(), StoreError> {
        let mut pointers: HashMap<SignId, SignEventId> = HashMap::new();
        for t in transitions {
            let current = match pointers.get(&t.sign_id) {
                Some(id) => *id,
                None => self
                    .signs
                    .get(&t.sign_id)
                    .map(|s| s.current_event)
                    .ok_or_else(|| StoreError::NotFound(format!("sign {}", t.sign_id)))?,
            };
            if current != t.expected {
                return Err(StoreError::Conflict {
                    sign_id: t.sign_id,
                    expected: t.expected,
                    actual: Some(current),
                });
            }
            pointers.insert(t.sign_id, t.event.id);
        }
        Ok(())
    }

    fn apply(&mut self, transitions: Vec<Transition>) {
        for t in transitions {
            if t.cancel_previous {
                if let Some(previous) = self.events.get_mut(&t.expected) {
                    previous.cancelled = true;
                }
            }
            if let Some(sign) = self.signs.get_mut(&t.sign_id) {
                sign.current_event = t.event.id;
            }
            self.history.entry(t.sign_id).or_default().push(t.event.id);
            self.events.insert(t.event.id, t.event);
        }
    }
}

/// In-memory [`SignStore`].
///
/// # Example
///
/// ```
/// use marksign_testing::InMemorySignStore;
///
/// let store = InMemorySignStore::new();
/// assert_eq!(store.len(), 0);
/// store.set_unavailable(true); // every call now fails with a database error
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySignStore {
    state: Arc<RwLock<SignState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySignStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().signs.len()
    }

    /// Whether no sign is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of event versions across all signs.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.state.read().unwrap().events.len()
    }

    /// Simulate an outage: every call fails with [`StoreError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database("store unavailable".to_string()));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&SignState) -> T) -> Result<T, StoreError> {
        self.check_available()?;
        Ok(f(&self.state.read().unwrap()))
    }
}

impl SignStore for InMemorySignStore {
    fn insert(&self, sign: Sign, event: SignEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.write().unwrap();
            if !state.codes.insert(sign.code.identity()) {
                return Err(StoreError::DuplicateCode(sign.code.code));
            }
            state.history.insert(sign.id, vec![event.id]);
            state.order.push(sign.id);
            state.events.insert(event.id, event);
            state.signs.insert(sign.id, sign);
            Ok(())
        })
    }

    fn load_sign(&self, id: SignId) -> StoreFuture<'_, Option<Sign>> {
        Box::pin(async move { self.read(|s| s.signs.get(&id).cloned()) })
    }

    fn load_event(&self, id: SignEventId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move { self.read(|s| s.events.get(&id).cloned()) })
    }

    fn current_event(&self, id: SignId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move { self.read(|s| s.current(id).cloned()) })
    }

    fn history(&self, id: SignId) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.read(|s| {
                s.history
                    .get(&id)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|e| s.events.get(e).cloned())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
        })
    }

    fn commit(&self, transitions: Vec<Transition>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.write().unwrap();
            state.validate(&transitions)?;
            state.apply(transitions);
            Ok(())
        })
    }

    fn claim_new(&self, claim: NewClaim) -> StoreFuture<'_, Claim> {
        Box::pin(async move {
            self.check_available()?;
            // The write lock spans selection and commit, so claims never overlap.
            let mut state = self.state.write().unwrap();
            let candidates: Vec<SignEvent> = state
                .current_events()
                .filter(|e| e.is_allocatable_for(&claim.key))
                .take(claim.quantity)
                .cloned()
                .collect();
            if candidates.len() < claim.quantity {
                return Ok(Claim::Short {
                    available: candidates.len(),
                });
            }

            let transitions = claim.plan(&candidates)?;
            state.apply(transitions.clone());
            Ok(Claim::Claimed(transitions))
        })
    }

    fn find_new(&self, key: AllocationKey, limit: usize) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.read(|s| {
                s.current_events()
                    .filter(|e| e.is_allocatable_for(&key))
                    .take(limit)
                    .cloned()
                    .collect()
            })
        })
    }

    fn query(&self, query: SignQuery) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.read(|s| {
                s.current_events()
                    .filter(|e| query.matches(e))
                    .cloned()
                    .collect()
            })
        })
    }

    fn find_by_code_fragment(
        &self,
        user: UserId,
        fragment: String,
    ) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            self.read(|s| {
                s.order
                    .iter()
                    .rev()
                    .filter_map(|id| s.signs.get(id))
                    .filter(|sign| sign.code.code.contains(&fragment))
                    .filter_map(|sign| s.current(sign.id))
                    .find(|e| e.invariable.user == user)
                    .cloned()
            })
        })
    }

    fn code_exists(&self, user: UserId, code: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.read(|s| {
                s.signs
                    .values()
                    .filter(|sign| sign.code.code == code)
                    .filter_map(|sign| s.current(sign.id))
                    .any(|e| e.invariable.user == user)
            })
        })
    }

    fn attach_artifact(&self, id: SignId, artifact: CodeArtifact) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.write().unwrap();
            let sign = state
                .signs
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("sign {id}")))?;
            sign.code.artifact = Some(artifact);
            Ok(())
        })
    }
}

#[derive(Clone, Debug)]
struct DedupEntry {
    executed_at: Option<DateTime<Utc>>,
    claimed_at: DateTime<Utc>,
}

/// In-memory [`DedupStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDedupStore {
    entries: Arc<RwLock<HashMap<DedupKey, DedupEntry>>>,
}

impl InMemoryDedupStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is marked executed.
    #[must_use]
    pub fn is_executed(&self, key: &DedupKey) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .is_some_and(|e| e.executed_at.is_some())
    }

    /// Whether any record exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupStore for InMemoryDedupStore {
    fn claim(&self, key: DedupKey, lease: Duration) -> DedupFuture<'_, bool> {
        Box::pin(async move {
            let now = Utc::now();
            let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
            let expired = |claimed_at: DateTime<Utc>| {
                claimed_at
                    .checked_add_signed(lease)
                    .is_some_and(|until| until <= now)
            };
            let mut entries = self.entries.write().unwrap();
            match entries.get_mut(&key) {
                None => {
                    entries.insert(
                        key,
                        DedupEntry {
                            executed_at: None,
                            claimed_at: now,
                        },
                    );
                    Ok(true)
                },
                Some(entry) if entry.executed_at.is_none() && expired(entry.claimed_at) => {
                    entry.claimed_at = now;
                    Ok(true)
                },
                Some(_) => Ok(false),
            }
        })
    }

    fn mark_done(&self, key: DedupKey) -> DedupFuture<'_, ()> {
        Box::pin(async move {
            let now = Utc::now();
            self.entries
                .write()
                .unwrap()
                .entry(key)
                .and_modify(|e| e.executed_at = Some(now))
                .or_insert(DedupEntry {
                    executed_at: Some(now),
                    claimed_at: now,
                });
            Ok(())
        })
    }

    fn release(&self, key: DedupKey) -> DedupFuture<'_, ()> {
        Box::pin(async move {
            self.entries.write().unwrap().remove(&key);
            Ok(())
        })
    }

    fn purge_executed_before(&self, cutoff: DateTime<Utc>) -> DedupFuture<'_, u64> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap();
            let before = entries.len();
            entries.retain(|_, e| e.executed_at.is_none_or(|at| at >= cutoff));
            Ok((before - entries.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{numbered_code, Tenant};
    use crate::test_clock;
    use marksign_core::environment::Clock;
    use marksign_core::ids::{OrderId, PartId, ProductItemId};
    use marksign_core::transition::{admit, plan, SignCommand};

    async fn seeded(store: &InMemorySignStore, tenant: &Tenant, n: usize) -> Vec<SignEvent> {
        let mut events = Vec::new();
        for i in 0..n {
            let (sign, event) = admit(
                tenant.registration(&numbered_code(i)),
                SignId::new(),
                SignEventId::new(),
                test_clock().now(),
            )
            .unwrap();
            store.insert(sign, event.clone()).await.unwrap();
            events.push(event);
        }
        events
    }

    fn reserve(event: &SignEvent) -> Transition {
        plan(
            event,
            SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new()),
            SignEventId::new(),
            test_clock().now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_code_is_rejected() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        seeded(&store, &tenant, 1).await;

        let (sign, event) = admit(
            tenant.registration(&numbered_code(0)),
            SignId::new(),
            SignEventId::new(),
            test_clock().now(),
        )
        .unwrap();
        assert!(matches!(
            store.insert(sign, event).await,
            Err(StoreError::DuplicateCode(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn stale_commit_conflicts() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        let events = seeded(&store, &tenant, 1).await;

        store.commit(vec![reserve(&events[0])]).await.unwrap();
        let second = store.commit(vec![reserve(&events[0])]).await;
        assert!(matches!(second, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn batch_commit_is_all_or_nothing() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        let events = seeded(&store, &tenant, 2).await;

        store.commit(vec![reserve(&events[1])]).await.unwrap();
        let batch = vec![reserve(&events[0]), reserve(&events[1])];
        assert!(store.commit(batch).await.is_err());

        let free = store.find_new(tenant.key(), 10).await.unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id, events[0].id);
    }

    #[tokio::test]
    async fn find_new_is_oldest_first() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        let events = seeded(&store, &tenant, 3).await;

        let free = store.find_new(tenant.key(), 2).await.unwrap();
        let ids: Vec<_> = free.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![events[0].id, events[1].id]);
    }

    fn claim(tenant: &Tenant, quantity: usize) -> NewClaim {
        NewClaim {
            key: tenant.key(),
            quantity,
            command: SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new()),
            now: test_clock().now(),
        }
    }

    #[tokio::test]
    async fn claims_hand_out_disjoint_signs() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        let events = seeded(&store, &tenant, 3).await;

        let Claim::Claimed(first) = store.claim_new(claim(&tenant, 2)).await.unwrap() else {
            unreachable!("three signs are free");
        };
        let Claim::Claimed(second) = store.claim_new(claim(&tenant, 1)).await.unwrap() else {
            unreachable!("one sign is free");
        };

        let claimed: Vec<_> = first.iter().chain(&second).map(|t| t.expected).collect();
        assert_eq!(claimed, events.iter().map(|e| e.id).collect::<Vec<_>>());
        assert_eq!(
            store.claim_new(claim(&tenant, 1)).await.unwrap(),
            Claim::Short { available: 0 }
        );
    }

    #[tokio::test]
    async fn short_claim_writes_nothing() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        seeded(&store, &tenant, 2).await;

        assert_eq!(
            store.claim_new(claim(&tenant, 3)).await.unwrap(),
            Claim::Short { available: 2 }
        );
        assert_eq!(store.find_new(tenant.key(), 10).await.unwrap().len(), 2);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn illegal_claim_is_rejected_without_writing() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        seeded(&store, &tenant, 1).await;

        let mut illegal = claim(&tenant, 1);
        illegal.command = SignCommand::done();
        assert!(matches!(
            store.claim_new(illegal).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn fragment_lookup_is_scoped_to_user() {
        let store = InMemorySignStore::new();
        let tenant = Tenant::new();
        seeded(&store, &tenant, 1).await;

        assert!(store
            .find_by_code_fragment(tenant.user, "SN000000".to_string())
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_by_code_fragment(UserId::new(), "SN000000".to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dedup_claim_is_exclusive_until_released() {
        let store = InMemoryDedupStore::new();
        let key = DedupKey::new("ns", &["a"]);
        let lease = Duration::from_secs(60);

        assert!(store.claim(key.clone(), lease).await.unwrap());
        assert!(!store.claim(key.clone(), lease).await.unwrap());

        store.release(key.clone()).await.unwrap();
        assert!(store.claim(key.clone(), lease).await.unwrap());

        store.mark_done(key.clone()).await.unwrap();
        assert!(!store.claim(key.clone(), Duration::ZERO).await.unwrap());
        assert!(store.is_executed(&key));
    }

    #[tokio::test]
    async fn expired_unfinished_claim_can_be_retaken() {
        let store = InMemoryDedupStore::new();
        let key = DedupKey::new("ns", &["b"]);
        assert!(store.claim(key.clone(), Duration::ZERO).await.unwrap());
        assert!(store.claim(key, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_executed_keys() {
        let store = InMemoryDedupStore::new();
        let done = DedupKey::new("ns", &["done"]);
        let pending = DedupKey::new("ns", &["pending"]);
        store.mark_done(done.clone()).await.unwrap();
        store.claim(pending.clone(), Duration::from_secs(60)).await.unwrap();

        let purged = store
            .purge_executed_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!store.contains(&done));
        assert!(store.contains(&pending));
    }
}
