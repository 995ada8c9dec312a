//! Allocation of free signs.
//!
//! Selection and commit happen in one store-level claim that skips signs
//! another allocator is holding, so concurrent callers take disjoint signs
//! and only come back empty-handed when the inventory is really exhausted.

use crate::engine::TransitionEngine;
use crate::metrics::SignMetrics;
use marksign_core::SignError;
use marksign_core::sign::{AllocationKey, SignEvent};
use marksign_core::store::Claim;
use marksign_core::transition::SignCommand;
use std::sync::Arc;

/// Result of allocating one sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// The sign's new event.
    Allocated(SignEvent),
    /// No free sign matches the key.
    NotAvailable,
}

/// Result of allocating several signs at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchAllocation {
    /// All requested signs, transitioned together.
    Allocated(Vec<SignEvent>),
    /// Fewer free signs than requested; nothing was transitioned.
    NotAvailable {
        /// Requested quantity.
        requested: usize,
        /// Free signs found.
        available: usize,
    },
}

/// Picks free signs and moves them out of `New`.
#[derive(Clone)]
pub struct Allocator {
    engine: Arc<TransitionEngine>,
}

impl Allocator {
    /// Allocator committing through `engine`.
    #[must_use]
    pub const fn new(engine: Arc<TransitionEngine>) -> Self {
        Self { engine }
    }

    /// Engine the allocator commits through.
    #[must_use]
    pub fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    /// Apply `command` to the oldest free sign matching `key`.
    ///
    /// # Errors
    ///
    /// - [`SignError::ValidationFailed`] if `command` is not legal from `New`
    /// - [`SignError::Storage`] on persistence failure
    pub async fn allocate_one(
        &self,
        key: AllocationKey,
        command: SignCommand,
    ) -> Result<Allocation, SignError> {
        match self.allocate_batch(key, 1, command).await? {
            BatchAllocation::Allocated(mut events) => events
                .pop()
                .map(Allocation::Allocated)
                .ok_or_else(|| SignError::Storage("claim returned no event".to_string())),
            BatchAllocation::NotAvailable { .. } => Ok(Allocation::NotAvailable),
        }
    }

    /// Apply `command` to `quantity` free signs matching `key`, all or none.
    ///
    /// # Errors
    ///
    /// As [`allocate_one`](Self::allocate_one).
    pub async fn allocate_batch(
        &self,
        key: AllocationKey,
        quantity: usize,
        command: SignCommand,
    ) -> Result<BatchAllocation, SignError> {
        if quantity == 0 {
            return Ok(BatchAllocation::Allocated(Vec::new()));
        }

        match self.engine.claim_new(key, quantity, command).await? {
            Claim::Claimed(transitions) => {
                SignMetrics::record_allocation("allocated");
                Ok(BatchAllocation::Allocated(
                    transitions.into_iter().map(|t| t.event).collect(),
                ))
            },
            Claim::Short { available } => {
                SignMetrics::record_allocation("not_available");
                tracing::info!(
                    user = %key.user,
                    product = %key.product.product,
                    requested = quantity,
                    available,
                    "Not enough free signs"
                );
                Ok(BatchAllocation::NotAvailable {
                    requested: quantity,
                    available,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use marksign_core::ids::{OrderId, PartId, ProductItemId};
    use marksign_core::status::SignStatus;
    use marksign_testing::{InMemoryMessageBus, InMemorySignStore, Tenant, numbered_code, test_clock};

    async fn seeded(n: usize) -> (Allocator, Tenant, Vec<SignEvent>) {
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(InMemorySignStore::new()),
            Arc::new(InMemoryMessageBus::new()),
            Arc::new(test_clock()),
        ));
        let tenant = Tenant::new();
        let mut events = Vec::new();
        for i in 0..n {
            events.push(engine.register(tenant.registration(&numbered_code(i))).await.unwrap());
        }
        (Allocator::new(engine), tenant, events)
    }

    fn reserve() -> SignCommand {
        SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new())
    }

    #[tokio::test]
    async fn oldest_free_sign_is_allocated_first() {
        let (allocator, tenant, events) = seeded(3).await;

        let Allocation::Allocated(event) = allocator.allocate_one(tenant.key(), reserve()).await.unwrap() else {
            unreachable!("a free sign exists");
        };

        assert_eq!(event.sign_id, events[0].sign_id);
        assert_eq!(event.status, SignStatus::Process);
    }

    #[tokio::test]
    async fn empty_inventory_is_not_available() {
        let (allocator, tenant, _) = seeded(0).await;
        let result = allocator.allocate_one(tenant.key(), reserve()).await.unwrap();
        assert_eq!(result, Allocation::NotAvailable);
    }

    #[tokio::test]
    async fn other_users_signs_are_not_allocated() {
        let (allocator, _, _) = seeded(2).await;
        let stranger = Tenant::new();
        let result = allocator.allocate_one(stranger.key(), reserve()).await.unwrap();
        assert_eq!(result, Allocation::NotAvailable);
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let (allocator, tenant, _) = seeded(3).await;
        let store = Arc::clone(allocator.engine().store());

        let result = allocator
            .allocate_batch(tenant.key(), 5, SignCommand::decommission(PartId::new()))
            .await
            .unwrap();

        assert_eq!(
            result,
            BatchAllocation::NotAvailable {
                requested: 5,
                available: 3
            }
        );
        assert_eq!(store.find_new(tenant.key(), 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn zero_quantity_allocates_nothing() {
        let (allocator, tenant, _) = seeded(1).await;
        let result = allocator
            .allocate_batch(tenant.key(), 0, SignCommand::decommission(PartId::new()))
            .await
            .unwrap();
        assert_eq!(result, BatchAllocation::Allocated(Vec::new()));
    }

    #[tokio::test]
    async fn batch_takes_the_oldest_signs() {
        let (allocator, tenant, events) = seeded(4).await;

        let BatchAllocation::Allocated(allocated) = allocator
            .allocate_batch(tenant.key(), 2, SignCommand::decommission(PartId::new()))
            .await
            .unwrap()
        else {
            unreachable!("four signs are free");
        };

        let ids: Vec<_> = allocated.iter().map(|e| e.sign_id).collect();
        assert_eq!(ids, vec![events[0].sign_id, events[1].sign_id]);
        assert!(allocated.iter().all(|e| e.status == SignStatus::Decommission));
    }

    #[tokio::test]
    async fn illegal_command_is_a_validation_failure() {
        let (allocator, tenant, _) = seeded(1).await;
        let store = Arc::clone(allocator.engine().store());

        let result = allocator.allocate_one(tenant.key(), SignCommand::done()).await;

        assert!(matches!(result, Err(SignError::ValidationFailed { .. })));
        assert_eq!(store.find_new(tenant.key(), 10).await.unwrap().len(), 1);
    }
}
