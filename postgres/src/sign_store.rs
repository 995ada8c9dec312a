//! `PostgreSQL`-backed [`SignStore`].
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE sign (
//!     id UUID PRIMARY KEY,
//!     code TEXT NOT NULL,
//!     identity TEXT NOT NULL UNIQUE, -- GTIN + serial
//!     artifact JSONB,
//!     current_event UUID NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     seq BIGSERIAL NOT NULL
//! );
//!
//! CREATE TABLE sign_event (
//!     id UUID PRIMARY KEY,
//!     sign_id UUID NOT NULL REFERENCES sign(id),
//!     status TEXT NOT NULL,
//!     -- order linkage, invariable columns, cancelled flag ...
//!     seq BIGSERIAL NOT NULL
//! );
//! ```
//!
//! # Concurrency
//!
//! [`SignStore::commit`] moves each pointer with
//! `UPDATE sign SET current_event = $new WHERE id = $sign AND current_event = $expected`
//! inside one transaction. The row lock taken by the first writer makes any
//! concurrent writer re-evaluate the predicate and match zero rows, which is
//! reported as [`StoreError::Conflict`] and rolls the whole batch back.
//!
//! [`SignStore::claim_new`] selects free signs with
//! `FOR UPDATE OF s SKIP LOCKED` and commits them in the same transaction,
//! so concurrent allocators take disjoint signs instead of conflicting.

use crate::database_error;
use marksign_core::StoreError;
use marksign_core::ids::{
    ModificationId, OfferId, OrderId, PartId, ProductId, ProductItemId, ProfileId, SignEventId,
    SignId, UserId, VariationId,
};
use marksign_core::sign::{
    AllocationKey, CodeArtifact, ProductKey, Sign, SignCode, SignEvent, SignInvariable, SignQuery,
};
use marksign_core::status::SignStatus;
use marksign_core::store::{Claim, NewClaim, SignStore, StoreFuture};
use marksign_core::transition::Transition;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::time::Instant;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "e.id, e.sign_id, e.status, e.order_id, e.product_item_id, e.comment, \
     e.user_id, e.profile_id, e.seller_id, e.product_id, e.offer_id, e.variation_id, \
     e.modification_id, e.part_id, e.declaration, e.cancelled, e.created_at";

/// Sign storage over a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PostgresSignStore {
    pool: PgPool,
}

impl PostgresSignStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_events(&self, sql: &str, binds: EventBinds) -> Result<Vec<SignEvent>, StoreError> {
        fetch_events_on(&self.pool, sql, binds).await
    }
}

async fn fetch_events_on<'c, E>(
    executor: E,
    sql: &str,
    binds: EventBinds,
) -> Result<Vec<SignEvent>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let mut query = sqlx::query(sql);
    for bind in binds.0 {
        query = match bind {
            Bind::Uuid(value) => query.bind(value),
            Bind::Text(value) => query.bind(value),
            Bind::Texts(values) => query.bind(values),
            Bind::Int(value) => query.bind(value),
        };
    }
    let rows = query
        .fetch_all(executor)
        .await
        .map_err(|e| database_error(&e))?;
    rows.iter().map(row_to_event).collect()
}

enum Bind {
    Uuid(Option<Uuid>),
    Text(String),
    Texts(Vec<String>),
    Int(i64),
}

#[derive(Default)]
struct EventBinds(Vec<Bind>);

impl EventBinds {
    fn uuid(mut self, value: Option<Uuid>) -> Self {
        self.0.push(Bind::Uuid(value));
        self
    }

    fn text(mut self, value: String) -> Self {
        self.0.push(Bind::Text(value));
        self
    }

    fn texts(mut self, values: Vec<String>) -> Self {
        self.0.push(Bind::Texts(values));
        self
    }

    fn int(mut self, value: i64) -> Self {
        self.0.push(Bind::Int(value));
        self
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("column {name}: {e}")))
}

fn row_to_event(row: &PgRow) -> Result<SignEvent, StoreError> {
    let status: String = column(row, "status")?;
    let status =
        SignStatus::parse(&status).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let optional = |name: &str| column::<Option<Uuid>>(row, name);

    Ok(SignEvent {
        id: SignEventId::from_uuid(column(row, "id")?),
        sign_id: SignId::from_uuid(column(row, "sign_id")?),
        status,
        order: optional("order_id")?.map(OrderId::from_uuid),
        product_item: optional("product_item_id")?.map(ProductItemId::from_uuid),
        comment: column(row, "comment")?,
        invariable: SignInvariable {
            user: UserId::from_uuid(column(row, "user_id")?),
            profile: ProfileId::from_uuid(column(row, "profile_id")?),
            seller: optional("seller_id")?.map(ProfileId::from_uuid),
            product: ProductKey {
                product: ProductId::from_uuid(column(row, "product_id")?),
                offer: optional("offer_id")?.map(OfferId::from_uuid),
                variation: optional("variation_id")?.map(VariationId::from_uuid),
                modification: optional("modification_id")?.map(ModificationId::from_uuid),
            },
            part: optional("part_id")?.map(PartId::from_uuid),
            declaration: column(row, "declaration")?,
        },
        cancelled: column(row, "cancelled")?,
        created_at: column(row, "created_at")?,
    })
}

fn row_to_sign(row: &PgRow) -> Result<Sign, StoreError> {
    let artifact: Option<Json<CodeArtifact>> = column(row, "artifact")?;
    Ok(Sign {
        id: SignId::from_uuid(column(row, "id")?),
        code: SignCode {
            code: column(row, "code")?,
            artifact: artifact.map(|json| json.0),
        },
        current_event: SignEventId::from_uuid(column(row, "current_event")?),
        created_at: column(row, "created_at")?,
    })
}

async fn insert_event(conn: &mut PgConnection, event: &SignEvent) -> Result<(), StoreError> {
    let invariable = &event.invariable;
    sqlx::query(
        r"
        INSERT INTO sign_event (
            id, sign_id, status, order_id, product_item_id, comment,
            user_id, profile_id, seller_id, product_id, offer_id, variation_id,
            modification_id, part_id, declaration, cancelled, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ",
    )
    .bind(event.id.as_uuid())
    .bind(event.sign_id.as_uuid())
    .bind(event.status.as_str())
    .bind(event.order.map(|id| id.as_uuid()))
    .bind(event.product_item.map(|id| id.as_uuid()))
    .bind(event.comment.as_deref())
    .bind(invariable.user.as_uuid())
    .bind(invariable.profile.as_uuid())
    .bind(invariable.seller.map(|id| id.as_uuid()))
    .bind(invariable.product.product.as_uuid())
    .bind(invariable.product.offer.map(|id| id.as_uuid()))
    .bind(invariable.product.variation.map(|id| id.as_uuid()))
    .bind(invariable.product.modification.map(|id| id.as_uuid()))
    .bind(invariable.part.map(|id| id.as_uuid()))
    .bind(invariable.declaration.as_deref())
    .bind(event.cancelled)
    .bind(event.created_at)
    .execute(conn)
    .await
    .map_err(|e| database_error(&e))?;
    Ok(())
}

/// Move one pointer, or explain why it did not move.
async fn swap_pointer(conn: &mut PgConnection, transition: &Transition) -> Result<(), StoreError> {
    let moved = sqlx::query(
        "UPDATE sign SET current_event = $1 WHERE id = $2 AND current_event = $3",
    )
    .bind(transition.event.id.as_uuid())
    .bind(transition.sign_id.as_uuid())
    .bind(transition.expected.as_uuid())
    .execute(&mut *conn)
    .await
    .map_err(|e| database_error(&e))?
    .rows_affected();

    if moved > 0 {
        return Ok(());
    }

    let actual: Option<(Uuid,)> = sqlx::query_as("SELECT current_event FROM sign WHERE id = $1")
        .bind(transition.sign_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| database_error(&e))?;

    Err(match actual {
        None => StoreError::NotFound(format!("sign {}", transition.sign_id)),
        Some((actual,)) => StoreError::Conflict {
            sign_id: transition.sign_id,
            expected: transition.expected,
            actual: Some(SignEventId::from_uuid(actual)),
        },
    })
}

/// Swap the pointer, append the event and retire the previous one if asked.
async fn apply_transition(conn: &mut PgConnection, transition: &Transition) -> Result<(), StoreError> {
    swap_pointer(&mut *conn, transition).await?;
    insert_event(&mut *conn, &transition.event).await?;
    if transition.cancel_previous {
        sqlx::query("UPDATE sign_event SET cancelled = TRUE WHERE id = $1")
            .bind(transition.expected.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|e| database_error(&e))?;
    }
    Ok(())
}

/// Free signs matching an allocation key, oldest first. `FOR UPDATE`
/// variants append their locking clause after `LIMIT $8`.
fn free_signs_sql() -> String {
    format!(
        r"
        SELECT {EVENT_COLUMNS}
        FROM sign s JOIN sign_event e ON e.id = s.current_event
        WHERE e.status = $1
          AND e.user_id = $2
          AND ($3::uuid IS NULL OR e.profile_id = $3)
          AND e.product_id = $4
          AND e.offer_id IS NOT DISTINCT FROM $5::uuid
          AND e.variation_id IS NOT DISTINCT FROM $6::uuid
          AND e.modification_id IS NOT DISTINCT FROM $7::uuid
        ORDER BY s.seq
        LIMIT $8
        "
    )
}

fn free_sign_binds(key: &AllocationKey, limit: usize) -> EventBinds {
    let product = &key.product;
    EventBinds::default()
        .text(SignStatus::New.as_str().to_string())
        .uuid(Some(key.user.as_uuid()))
        .uuid(key.profile.map(|id| id.as_uuid()))
        .uuid(Some(product.product.as_uuid()))
        .uuid(product.offer.map(|id| id.as_uuid()))
        .uuid(product.variation.map(|id| id.as_uuid()))
        .uuid(product.modification.map(|id| id.as_uuid()))
        .int(limit_of(limit))
}

fn limit_of(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl SignStore for PostgresSignStore {
    fn insert(&self, sign: Sign, event: SignEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| database_error(&e))?;

            sqlx::query(
                r"
                INSERT INTO sign (id, code, identity, artifact, current_event, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(sign.id.as_uuid())
            .bind(&sign.code.code)
            .bind(sign.code.identity())
            .bind(sign.code.artifact.as_ref().map(Json))
            .bind(sign.current_event.as_uuid())
            .bind(sign.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::DuplicateCode(sign.code.code.clone())
                },
                _ => database_error(&e),
            })?;

            insert_event(&mut tx, &event).await?;
            tx.commit().await.map_err(|e| database_error(&e))?;

            tracing::debug!(sign_id = %sign.id, "Sign inserted");
            Ok(())
        })
    }

    fn load_sign(&self, id: SignId) -> StoreFuture<'_, Option<Sign>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, code, artifact, current_event, created_at FROM sign WHERE id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
            row.as_ref().map(row_to_sign).transpose()
        })
    }

    fn load_event(&self, id: SignEventId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM sign_event e WHERE e.id = $1");
            let mut events = self
                .fetch_events(&sql, EventBinds::default().uuid(Some(id.as_uuid())))
                .await?;
            Ok(events.pop())
        })
    }

    fn current_event(&self, id: SignId) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM sign s JOIN sign_event e ON e.id = s.current_event \
                 WHERE s.id = $1"
            );
            let mut events = self
                .fetch_events(&sql, EventBinds::default().uuid(Some(id.as_uuid())))
                .await?;
            Ok(events.pop())
        })
    }

    fn history(&self, id: SignId) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM sign_event e WHERE e.sign_id = $1 ORDER BY e.seq"
            );
            self.fetch_events(&sql, EventBinds::default().uuid(Some(id.as_uuid())))
                .await
        })
    }

    fn commit(&self, transitions: Vec<Transition>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let mut tx = self.pool.begin().await.map_err(|e| database_error(&e))?;

            for transition in &transitions {
                // Dropping `tx` on error rolls back every earlier step.
                apply_transition(&mut tx, transition).await?;
            }

            tx.commit().await.map_err(|e| database_error(&e))?;

            metrics::histogram!("sign_store_commit_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            tracing::debug!(count = transitions.len(), "Transitions committed");
            Ok(())
        })
    }

    fn find_new(&self, key: AllocationKey, limit: usize) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            self.fetch_events(&free_signs_sql(), free_sign_binds(&key, limit))
                .await
        })
    }

    fn claim_new(&self, claim: NewClaim) -> StoreFuture<'_, Claim> {
        Box::pin(async move {
            let started = Instant::now();
            let mut tx = self.pool.begin().await.map_err(|e| database_error(&e))?;

            // Rows locked by a concurrent claim are skipped rather than waited on,
            // and rows whose pointer moved before we locked them fail the re-checked
            // predicate, so every row returned here is free and ours.
            let sql = format!("{} FOR UPDATE OF s SKIP LOCKED", free_signs_sql());
            let candidates = fetch_events_on(
                &mut *tx,
                &sql,
                free_sign_binds(&claim.key, claim.quantity),
            )
            .await?;

            if candidates.len() < claim.quantity {
                // Nothing written; dropping `tx` releases the locks.
                return Ok(Claim::Short {
                    available: candidates.len(),
                });
            }

            let transitions = claim.plan(&candidates)?;
            for transition in &transitions {
                apply_transition(&mut tx, transition).await?;
            }
            tx.commit().await.map_err(|e| database_error(&e))?;

            metrics::histogram!("sign_store_claim_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            tracing::debug!(count = transitions.len(), "Free signs claimed");
            Ok(Claim::Claimed(transitions))
        })
    }

    fn query(&self, query: SignQuery) -> StoreFuture<'_, Vec<SignEvent>> {
        Box::pin(async move {
            let sql = format!(
                r"
                SELECT {EVENT_COLUMNS}
                FROM sign s JOIN sign_event e ON e.id = s.current_event
                WHERE ($1::uuid IS NULL OR e.order_id = $1)
                  AND ($2::uuid IS NULL OR e.part_id = $2)
                  AND (cardinality($3::text[]) = 0 OR e.status = ANY($3))
                  AND ($4::uuid IS NULL OR e.product_item_id = $4)
                  AND ($5::uuid IS NULL OR e.user_id = $5)
                ORDER BY s.seq
                "
            );
            let statuses = query
                .statuses
                .iter()
                .map(|status| status.as_str().to_string())
                .collect();
            let binds = EventBinds::default()
                .uuid(query.order.map(|id| id.as_uuid()))
                .uuid(query.part.map(|id| id.as_uuid()))
                .texts(statuses)
                .uuid(query.product_item.map(|id| id.as_uuid()))
                .uuid(query.user.map(|id| id.as_uuid()));
            self.fetch_events(&sql, binds).await
        })
    }

    fn find_by_code_fragment(
        &self,
        user: UserId,
        fragment: String,
    ) -> StoreFuture<'_, Option<SignEvent>> {
        Box::pin(async move {
            let sql = format!(
                r"
                SELECT {EVENT_COLUMNS}
                FROM sign s JOIN sign_event e ON e.id = s.current_event
                WHERE e.user_id = $1 AND strpos(s.code, $2) > 0
                ORDER BY s.seq DESC
                LIMIT 1
                "
            );
            let binds = EventBinds::default()
                .uuid(Some(user.as_uuid()))
                .text(fragment);
            let mut events = self.fetch_events(&sql, binds).await?;
            Ok(events.pop())
        })
    }

    fn code_exists(&self, user: UserId, code: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                r"
                SELECT EXISTS(
                    SELECT 1 FROM sign s JOIN sign_event e ON e.id = s.current_event
                    WHERE s.code = $1 AND e.user_id = $2
                )
                ",
            )
            .bind(code)
            .bind(user.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
            Ok(exists)
        })
    }

    fn attach_artifact(&self, id: SignId, artifact: CodeArtifact) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let updated = sqlx::query("UPDATE sign SET artifact = $1 WHERE id = $2")
                .bind(Json(&artifact))
                .bind(id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(|e| database_error(&e))?
                .rows_affected();

            if updated == 0 {
                return Err(StoreError::NotFound(format!("sign {id}")));
            }
            tracing::debug!(sign_id = %id, file = %artifact.file_name(), "Artifact attached");
            Ok(())
        })
    }
}
