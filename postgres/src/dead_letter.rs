//! Dead-letter table for messages that exhausted processing.
//!
//! Each write appends one row. There is no uniqueness constraint on
//! `message_id`: a message redelivered after a crash may be dead-lettered
//! twice and both rows are kept.

use chrono::{DateTime, Utc};
use notification_relay_core::BoxFuture;
use notification_relay_core::dead_letter::{
    DeadLetterMetadata, DeadLetterRecord, DeadLetterSink, SinkWriteError,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;

/// Errors from the `PostgreSQL` dead-letter store.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// Could not connect to the database
    #[error("Failed to connect to PostgreSQL: {0}")]
    Connection(String),

    /// A query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back
    #[error("Invalid dead-letter row {id}: {reason}")]
    InvalidRow {
        /// Row id
        id: i64,
        /// What was wrong
        reason: String,
    },
}

/// A dead-letter row read back from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDeadLetter {
    /// Row id, increasing in insertion order
    pub id: i64,
    /// Record metadata
    pub metadata: DeadLetterMetadata,
    /// Original raw bytes of the message
    pub raw: Vec<u8>,
}

/// `PostgreSQL`-backed [`DeadLetterSink`].
///
/// # Example
///
/// ```no_run
/// use notification_relay_postgres::PostgresDeadLetterSink;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let sink = PostgresDeadLetterSink::new(pool);
/// sink.ensure_schema().await?;
///
/// for stored in sink.list_recent(20).await? {
///     println!("{} {}", stored.metadata.final_error_kind, stored.metadata.final_error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterSink {
    pool: PgPool,
}

impl PostgresDeadLetterSink {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a small pool.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Connection`] if the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(5) // Dead letters are low-volume
            .connect(database_url)
            .await
            .map_err(|e| PostgresError::Connection(e.to_string()))?;

        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `dead_letters` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), PostgresError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id BIGSERIAL PRIMARY KEY,
                message_id TEXT,
                source_topic TEXT NOT NULL,
                final_error_kind TEXT NOT NULL,
                final_error_message TEXT NOT NULL,
                attempts_made INTEGER NOT NULL CHECK (attempts_made >= 1),
                dead_lettered_at TIMESTAMPTZ NOT NULL,
                raw BYTEA NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_source_topic ON dead_letters(source_topic)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_message_id ON dead_letters(message_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one record, returning its row id.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the insert fails.
    pub async fn insert(&self, record: &DeadLetterRecord) -> Result<i64, PostgresError> {
        let attempts = i32::try_from(record.attempts_made).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                message_id, source_topic, final_error_kind, final_error_message,
                attempts_made, dead_lettered_at, raw
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(record.message_id.as_deref())
        .bind(&record.source_topic)
        .bind(record.final_error_kind.as_str())
        .bind(&record.final_error_message)
        .bind(attempts)
        .bind(record.dead_lettered_at)
        .bind(&record.raw)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            dead_letter_id = id,
            message_id = record.message_id.as_deref().unwrap_or("unknown"),
            source_topic = %record.source_topic,
            final_error_kind = %record.final_error_kind,
            attempts_made = record.attempts_made,
            "Message stored in dead-letter table"
        );

        metrics::counter!(
            "dead_letter.postgres.stored",
            "source_topic" => record.source_topic.clone()
        )
        .increment(1);

        Ok(id)
    }

    /// Most recent records first.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError`] if the query fails or a row is malformed.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, PostgresError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT id, message_id, source_topic, final_error_kind, final_error_message,
                   attempts_made, dead_lettered_at, raw
            FROM dead_letters
            ORDER BY id DESC
            LIMIT $1
            ",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stored).collect()
    }

    /// Records dead-lettered from `source_topic`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError`] if the query fails or a row is malformed.
    pub async fn list_by_source_topic(
        &self,
        source_topic: &str,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, PostgresError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT id, message_id, source_topic, final_error_kind, final_error_message,
                   attempts_made, dead_lettered_at, raw
            FROM dead_letters
            WHERE source_topic = $1
            ORDER BY id ASC
            LIMIT $2
            ",
        )
        .bind(source_topic)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stored).collect()
    }

    /// Total number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, PostgresError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

impl DeadLetterSink for PostgresDeadLetterSink {
    fn write<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), SinkWriteError>> {
        Box::pin(async move {
            self.insert(record)
                .await
                .map(|_| ())
                .map_err(into_sink_error)
        })
    }
}

impl std::fmt::Debug for PostgresDeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDeadLetterSink")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

/// Constraint violations mean the row itself is bad; everything else is an
/// outage.
fn into_sink_error(err: PostgresError) -> SinkWriteError {
    match err {
        PostgresError::Database(sqlx::Error::Database(db)) => SinkWriteError::Rejected(db.to_string()),
        other => SinkWriteError::Unavailable(other.to_string()),
    }
}

fn row_to_stored(row: &PgRow) -> Result<StoredDeadLetter, PostgresError> {
    let id: i64 = row.try_get("id")?;
    let attempts: i32 = row.try_get("attempts_made")?;
    let attempts_made = u32::try_from(attempts).map_err(|_| PostgresError::InvalidRow {
        id,
        reason: format!("negative attempts_made {attempts}"),
    })?;
    let dead_lettered_at: DateTime<Utc> = row.try_get("dead_lettered_at")?;

    Ok(StoredDeadLetter {
        id,
        metadata: DeadLetterMetadata {
            message_id: row.try_get("message_id")?,
            source_topic: row.try_get("source_topic")?,
            final_error_kind: row.try_get("final_error_kind")?,
            final_error_message: row.try_get("final_error_message")?,
            attempts_made,
            dead_lettered_at,
        },
        raw: row.try_get("raw")?,
    })
}
