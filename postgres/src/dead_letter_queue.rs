//! Dead Letter Queue (DLQ) for failed messages.
//!
//! Provides persistent storage and management of messages that exhausted their
//! retry budget, failed fatally, or could not be decoded. Enables observability,
//! incident response, and manual reprocessing workflows.

use crate::database_error;
use chrono::{DateTime, Utc};
use marksign_core::StoreError;
use marksign_core::dead_letter::{DeadLetter, DeadLetterSink};
use marksign_core::message::SerializedMessage;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Status of a failed message in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Message is pending investigation/reprocessing
    Pending,
    /// Message is currently being reprocessed
    Processing,
    /// Message was successfully reprocessed
    Resolved,
    /// Message was permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Serialization(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// Topic the message was consumed from
    pub topic: String,

    /// The message as received
    pub message: SerializedMessage,

    /// Envelope id, when the payload could be decoded
    pub message_id: Option<Uuid>,

    /// Error message from the last failure
    pub error_message: String,

    /// Structured diagnostic context
    pub details: Option<serde_json::Value>,

    /// Delivery attempts made before parking
    pub attempts: i32,

    /// When the message was parked
    pub first_failed_at: DateTime<Utc>,

    /// When the entry last changed
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use marksign_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// if let Some(first) = pending.first() {
///     dlq.update_status(first.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead letter to the DLQ.
    ///
    /// Returns the unique ID of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn add_entry(
        &self,
        letter: &DeadLetter,
        details: Option<serde_json::Value>,
    ) -> Result<i64, StoreError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                topic, message_type, message_data, message_id,
                error_message, details, attempts, first_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&letter.topic)
        .bind(&letter.message.message_type)
        .bind(&letter.message.data)
        .bind(letter.message_id)
        .bind(&letter.error_message)
        .bind(details)
        .bind(attempts)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| database_error(&e))?;

        tracing::warn!(
            dlq_id = id,
            topic = %letter.topic,
            message_type = %letter.message.message_type,
            error = %letter.error_message,
            attempts,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("dlq_added_total", "message_type" => letter.message.message_type.clone())
            .increment(1);

        Ok(id)
    }

    /// List pending failed messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed messages by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, topic, message_type, message_data, message_id,
                error_message, details, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE status = $1
            ORDER BY first_failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| database_error(&e))?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if there is no such entry,
    /// [`StoreError::Database`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, topic, message_type, message_data, message_id,
                error_message, details, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| database_error(&e))?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;

        Self::row_to_failed_message(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(&e))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(&e))?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded (permanently failed).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error(&e))?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Count of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;

        Ok(count)
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, StoreError> {
        let get = |e: sqlx::Error| StoreError::Serialization(e.to_string());
        let status: String = row.try_get("status").map_err(get)?;

        Ok(FailedMessage {
            id: row.try_get("id").map_err(get)?,
            topic: row.try_get("topic").map_err(get)?,
            message: SerializedMessage::new(
                row.try_get("message_type").map_err(get)?,
                row.try_get("message_data").map_err(get)?,
            ),
            message_id: row.try_get("message_id").map_err(get)?,
            error_message: row.try_get("error_message").map_err(get)?,
            details: row.try_get("details").map_err(get)?,
            attempts: row.try_get("attempts").map_err(get)?,
            first_failed_at: row.try_get("first_failed_at").map_err(get)?,
            last_failed_at: row.try_get("last_failed_at").map_err(get)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(get)?,
            resolved_by: row.try_get("resolved_by").map_err(get)?,
            resolution_notes: row.try_get("resolution_notes").map_err(get)?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let details = serde_json::json!({
                "payload_bytes": letter.message.data.len(),
                "decoded": letter.message_id.is_some(),
            });
            self.add_entry(&letter, Some(details)).await.map(|_| ())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn dlq_status_roundtrip() {
        for status in &[
            DLQStatus::Pending,
            DLQStatus::Processing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            let parsed = DLQStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert!(matches!(
            DLQStatus::parse("invalid"),
            Err(StoreError::Serialization(_))
        ));
    }
}
