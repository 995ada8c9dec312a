//! Marksign worker.
//!
//! Wires the Postgres stores and the Redpanda bus into the runtime and keeps
//! the dispatcher consuming lifecycle messages until shutdown.

pub mod config;
pub mod purge;
