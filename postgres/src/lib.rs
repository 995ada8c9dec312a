//! `PostgreSQL` storage for marksign.
//!
//! - [`PostgresSignStore`]: signs and their event history; the unique code
//!   constraint and the compare-and-swap on `sign.current_event` are the two
//!   points of mutual exclusion the lifecycle relies on
//! - [`PostgresDedupStore`]: idempotency keys with leased claims
//! - [`PostgresDeadLetterQueue`]: parked messages and their triage status
//!
//! All three share one pool. Run [`migrate`] once at startup.
//!
//! # Example
//!
//! ```no_run
//! use marksign_postgres::{PostgresDedupStore, PostgresSignStore, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/marksign").await?;
//! migrate(&pool).await?;
//!
//! let signs = PostgresSignStore::new(pool.clone());
//! let dedup = PostgresDedupStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod dedup_store;
pub mod sign_store;

pub use dead_letter_queue::{DLQStatus, FailedMessage, PostgresDeadLetterQueue};
pub use dedup_store::PostgresDedupStore;
pub use sign_store::PostgresSignStore;

use marksign_core::StoreError;
use sqlx::PgPool;

/// Apply the bundled migrations.
///
/// # Errors
///
/// [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
}

pub(crate) fn database_error(e: &sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
