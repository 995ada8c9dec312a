//! `PostgreSQL`-backed [`DedupStore`].
//!
//! The claim is a single upsert: the insert wins for the first caller, and the
//! conditional `DO UPDATE` only fires for an unfinished claim whose lease has
//! run out. `RETURNING` yields a row exactly when the caller now owns the key.

use crate::database_error;
use chrono::{DateTime, Utc};
use marksign_core::dedup::{DedupFuture, DedupKey, DedupStore};
use sqlx::PgPool;
use std::time::Duration;

/// Dedup keys over a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PostgresDedupStore {
    pool: PgPool,
}

impl PostgresDedupStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DedupStore for PostgresDedupStore {
    fn claim(&self, key: DedupKey, lease: Duration) -> DedupFuture<'_, bool> {
        Box::pin(async move {
            let claimed: Option<(DateTime<Utc>,)> = sqlx::query_as(
                r"
                INSERT INTO dedup_key (namespace, hash, claimed_at)
                VALUES ($1, $2, now())
                ON CONFLICT (namespace, hash) DO UPDATE
                SET claimed_at = now()
                WHERE dedup_key.executed_at IS NULL
                  AND dedup_key.claimed_at <= now() - make_interval(secs => $3)
                RETURNING claimed_at
                ",
            )
            .bind(key.namespace())
            .bind(key.hash())
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;

            Ok(claimed.is_some())
        })
    }

    fn mark_done(&self, key: DedupKey) -> DedupFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO dedup_key (namespace, hash, claimed_at, executed_at)
                VALUES ($1, $2, now(), now())
                ON CONFLICT (namespace, hash) DO UPDATE
                SET executed_at = now()
                ",
            )
            .bind(key.namespace())
            .bind(key.hash())
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
            Ok(())
        })
    }

    fn release(&self, key: DedupKey) -> DedupFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM dedup_key WHERE namespace = $1 AND hash = $2")
                .bind(key.namespace())
                .bind(key.hash())
                .execute(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(())
        })
    }

    fn purge_executed_before(&self, cutoff: DateTime<Utc>) -> DedupFuture<'_, u64> {
        Box::pin(async move {
            let purged = sqlx::query(
                "DELETE FROM dedup_key WHERE executed_at IS NOT NULL AND executed_at < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?
            .rows_affected();

            if purged > 0 {
                tracing::info!(purged, %cutoff, "Purged executed dedup keys");
            }
            Ok(purged)
        })
    }
}
