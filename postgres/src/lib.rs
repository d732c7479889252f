//! `PostgreSQL` dead-letter storage for the notification relay.
//!
//! [`PostgresDeadLetterSink`] implements
//! [`DeadLetterSink`](notification_relay_core::dead_letter::DeadLetterSink) on
//! top of an append-only `dead_letters` table. It is the alternative to the
//! Kafka dead-letter topic when operators want to query failures with SQL.
//!
//! # Example
//!
//! ```ignore
//! use notification_relay_postgres::PostgresDeadLetterSink;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = PostgresDeadLetterSink::connect("postgres://localhost/relay").await?;
//!     sink.ensure_schema().await?;
//!     println!("{} dead letters", sink.count().await?);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter;

pub use dead_letter::{PostgresDeadLetterSink, PostgresError, StoredDeadLetter};
