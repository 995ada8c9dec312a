//! # Marksign Runtime
//!
//! The imperative shell around `marksign-core`: everything that talks to a
//! store, a bus, or the network.
//!
//! ## Core Components
//!
//! - **Transition engine** ([`engine`]): registers signs and commits planned
//!   transitions through the store's compare-and-swap, then announces them
//! - **Allocator** ([`allocator`]): hands out free signs, never one twice
//! - **Deduplicator** ([`dedup`]): idempotency guards for handler side effects
//! - **Batch operations** ([`batch`]): part-level decommission, cancel and amend
//! - **Handlers** ([`handlers`]) and the **dispatcher** ([`dispatcher`]) that
//!   drives them from the bus with bounded delayed retries
//! - **Support**: [`retry`], [`dead_letter`], [`documents`], [`metrics`]
//!
//! ## Example
//!
//! ```
//! use marksign_runtime::allocator::{Allocation, Allocator};
//! use marksign_runtime::engine::TransitionEngine;
//! use marksign_core::ids::{OrderId, PartId, ProductItemId};
//! use marksign_core::transition::SignCommand;
//! use marksign_testing::{InMemoryMessageBus, InMemorySignStore, SCENARIO_CODE, Tenant, test_clock};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let engine = Arc::new(TransitionEngine::new(
//!     Arc::new(InMemorySignStore::new()),
//!     Arc::new(InMemoryMessageBus::new()),
//!     Arc::new(test_clock()),
//! ));
//! let tenant = Tenant::new();
//! engine.register(tenant.registration(SCENARIO_CODE)).await.unwrap();
//!
//! let allocator = Allocator::new(engine);
//! let command = SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new());
//! let allocation = allocator.allocate_one(tenant.key(), command).await.unwrap();
//! assert!(matches!(allocation, Allocation::Allocated(_)));
//! # });
//! ```

pub mod allocator;
pub mod batch;
pub mod dead_letter;
pub mod dedup;
pub mod dispatcher;
pub mod documents;
pub mod engine;
pub mod handlers;
pub mod metrics;
pub mod retry;

pub use allocator::{Allocation, Allocator, BatchAllocation};
pub use batch::{BatchOperations, Decommission};
pub use dead_letter::DeadLetterQueue;
pub use dedup::{DedupGuard, Deduplicator};
pub use dispatcher::{Dispatcher, DispatcherConfig, Disposition};
pub use engine::{EngineConfig, TransitionEngine};
pub use handlers::{HandlerError, Handlers, Outcome};
pub use retry::{RequeuePolicy, RetryPolicy};
