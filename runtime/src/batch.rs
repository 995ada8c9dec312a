//! Part-level operations: decommissioning a quantity of signs under one part,
//! cancelling a part, and amending every sign of a part at once.

use crate::allocator::{Allocator, BatchAllocation};
use crate::engine::TransitionEngine;
use marksign_core::SignError;
use marksign_core::ids::{PartId, ProfileId};
use marksign_core::sign::{AllocationKey, SignEvent, SignQuery};
use marksign_core::status::SignStatus;
use marksign_core::transition::SignCommand;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a decommission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decommission {
    /// Every requested sign is now under `part`.
    Completed {
        /// Part grouping the batch.
        part: PartId,
        /// New events, one per sign.
        signs: Vec<SignEvent>,
    },
    /// Not enough free signs; nothing changed.
    Insufficient {
        /// Requested quantity.
        requested: usize,
        /// Free signs found.
        available: usize,
    },
}

impl Decommission {
    /// Operator-facing summary.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Completed { part, signs } => {
                format!("{} signs decommissioned under part {part}", signs.len())
            },
            Self::Insufficient {
                requested,
                available,
            } => format!(
                "Not enough free signs: requested {requested}, available {available}, missing {}",
                requested.saturating_sub(*available)
            ),
        }
    }
}

/// Operations over a group of signs sharing a part.
#[derive(Clone)]
pub struct BatchOperations {
    allocator: Allocator,
    engine: Arc<TransitionEngine>,
}

impl BatchOperations {
    /// Operations committing through `allocator`'s engine.
    #[must_use]
    pub fn new(allocator: Allocator) -> Self {
        let engine = Arc::clone(allocator.engine());
        Self { allocator, engine }
    }

    /// Decommission `quantity` free signs matching `key` under a fresh part.
    ///
    /// # Errors
    ///
    /// [`SignError::ValidationFailed`] for an over-long comment, otherwise as
    /// [`Allocator::allocate_batch`].
    pub async fn decommission(
        &self,
        key: AllocationKey,
        quantity: usize,
        comment: Option<String>,
    ) -> Result<Decommission, SignError> {
        let part = PartId::new();
        let mut command = SignCommand::decommission(part);
        command.comment = comment;

        match self.allocator.allocate_batch(key, quantity, command).await? {
            BatchAllocation::Allocated(signs) => {
                tracing::info!(%part, count = signs.len(), "Decommissioned");
                Ok(Decommission::Completed { part, signs })
            },
            BatchAllocation::NotAvailable {
                requested,
                available,
            } => Ok(Decommission::Insufficient {
                requested,
                available,
            }),
        }
    }

    /// Return every sign of `part` to `New`.
    ///
    /// # Errors
    ///
    /// As [`TransitionEngine::apply_batch`].
    pub async fn cancel_part(&self, part: PartId) -> Result<Vec<SignEvent>, SignError> {
        let query = SignQuery::by_part(part)
            .with_status(SignStatus::Decommission)
            .with_status(SignStatus::Process)
            .with_status(SignStatus::Done);
        self.apply_to_part(query, SignCommand::cancel).await
    }

    /// Record a declaration number on every live sign of `part`.
    ///
    /// # Errors
    ///
    /// As [`TransitionEngine::apply_batch`]; a blank number is a validation
    /// failure.
    pub async fn link_declaration(
        &self,
        part: PartId,
        declaration: &str,
    ) -> Result<Vec<SignEvent>, SignError> {
        self.apply_to_part(live(part), || SignCommand::amend().with_declaration(declaration))
            .await
    }

    /// Assign every live sign of `part` to `seller`.
    ///
    /// # Errors
    ///
    /// As [`TransitionEngine::apply_batch`].
    pub async fn transfer(
        &self,
        part: PartId,
        seller: ProfileId,
    ) -> Result<Vec<SignEvent>, SignError> {
        self.apply_to_part(live(part), || SignCommand::amend().with_seller(seller))
            .await
    }

    async fn apply_to_part(
        &self,
        query: SignQuery,
        command: impl Fn() -> SignCommand,
    ) -> Result<Vec<SignEvent>, SignError> {
        let events = self
            .engine
            .store()
            .query(query)
            .await
            .map_err(|e| SignError::from_store(e, Uuid::new_v4()))?;
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.engine
            .apply_batch(events.into_iter().map(|e| (e.id, command())).collect())
            .await
    }
}

fn live(part: PartId) -> SignQuery {
    [
        SignStatus::New,
        SignStatus::Process,
        SignStatus::Done,
        SignStatus::Decommission,
        SignStatus::Return,
    ]
    .into_iter()
    .fold(SignQuery::by_part(part), SignQuery::with_status)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use marksign_testing::{InMemoryMessageBus, InMemorySignStore, Tenant, numbered_code, test_clock};

    async fn seeded(n: usize) -> (BatchOperations, Tenant) {
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(InMemorySignStore::new()),
            Arc::new(InMemoryMessageBus::new()),
            Arc::new(test_clock()),
        ));
        let tenant = Tenant::new();
        for i in 0..n {
            engine.register(tenant.registration(&numbered_code(i))).await.unwrap();
        }
        (BatchOperations::new(Allocator::new(engine)), tenant)
    }

    #[tokio::test]
    async fn decommission_groups_signs_under_one_part() {
        let (ops, tenant) = seeded(4).await;

        let Decommission::Completed { part, signs } = ops
            .decommission(tenant.key(), 3, Some("write-off".into()))
            .await
            .unwrap()
        else {
            unreachable!("enough free signs");
        };

        assert_eq!(signs.len(), 3);
        assert!(signs.iter().all(|s| s.invariable.part == Some(part)));
        assert!(signs.iter().all(|s| s.comment.as_deref() == Some("write-off")));
    }

    #[tokio::test]
    async fn insufficient_stock_reports_the_shortfall() {
        let (ops, tenant) = seeded(3).await;

        let result = ops.decommission(tenant.key(), 5, None).await.unwrap();

        assert_eq!(
            result,
            Decommission::Insufficient {
                requested: 5,
                available: 3
            }
        );
        assert!(result.message().contains("missing 2"));
    }

    #[tokio::test]
    async fn cancel_part_frees_every_sign() {
        let (ops, tenant) = seeded(2).await;
        let Decommission::Completed { part, .. } =
            ops.decommission(tenant.key(), 2, None).await.unwrap()
        else {
            unreachable!("enough free signs");
        };

        let cancelled = ops.cancel_part(part).await.unwrap();

        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|e| e.status == SignStatus::New));
        let store = ops.engine.store();
        assert_eq!(store.find_new(tenant.key(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn declaration_and_seller_are_amended_in_place() {
        let (ops, tenant) = seeded(2).await;
        let Decommission::Completed { part, .. } =
            ops.decommission(tenant.key(), 2, None).await.unwrap()
        else {
            unreachable!("enough free signs");
        };
        let seller = ProfileId::new();

        let linked = ops.link_declaration(part, "10702070/010125/0000001").await.unwrap();
        let moved = ops.transfer(part, seller).await.unwrap();

        assert!(linked.iter().all(|e| e.status == SignStatus::Decommission));
        assert!(moved.iter().all(|e| e.invariable.seller == Some(seller)));
        assert!(
            moved
                .iter()
                .all(|e| e.invariable.declaration.as_deref() == Some("10702070/010125/0000001"))
        );
    }

    #[tokio::test]
    async fn blank_declaration_is_rejected() {
        let (ops, tenant) = seeded(1).await;
        let Decommission::Completed { part, .. } =
            ops.decommission(tenant.key(), 1, None).await.unwrap()
        else {
            unreachable!("enough free signs");
        };

        let err = ops.link_declaration(part, "   ").await.unwrap_err();
        assert!(matches!(err, SignError::ValidationFailed { .. }));
    }
}
