//! Dead-letter records and the sink they are written to.
//!
//! A message escalates to the dead-letter sink when it fails permanently or
//! exhausts its retry budget. Only after the sink confirms the write may the
//! source message be acknowledged; a failed sink write leaves the message
//! unacknowledged so the transport redelivers it.

use crate::error::{ErrorKind, ProcessingFailure};
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The terminal record of a message that could not be processed.
///
/// `raw` holds the original bytes exactly as received, so the message can be
/// replayed after the cause is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Message id, when the envelope parsed far enough to have one
    pub message_id: Option<String>,
    /// Original message bytes
    pub raw: Vec<u8>,
    /// Topic the message was consumed from (never a retry lane)
    pub source_topic: String,
    /// Kind of the final failure
    pub final_error_kind: ErrorKind,
    /// Message of the final failure
    pub final_error_message: String,
    /// Number of processing attempts made, at least 1
    pub attempts_made: u32,
    /// When the record was created
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Build a record from the final failure of a message.
    #[must_use]
    pub fn new(
        raw: Vec<u8>,
        source_topic: impl Into<String>,
        failure: &ProcessingFailure,
        attempts_made: u32,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: None,
            raw,
            source_topic: source_topic.into(),
            final_error_kind: failure.kind,
            final_error_message: failure.message.clone(),
            attempts_made: attempts_made.max(1),
            dead_lettered_at,
        }
    }

    /// Attach the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Metadata view of this record, without the raw bytes.
    #[must_use]
    pub fn metadata(&self) -> DeadLetterMetadata {
        DeadLetterMetadata {
            message_id: self.message_id.clone(),
            source_topic: self.source_topic.clone(),
            final_error_kind: self.final_error_kind.as_str().to_string(),
            final_error_message: self.final_error_message.clone(),
            attempts_made: self.attempts_made,
            dead_lettered_at: self.dead_lettered_at,
        }
    }

    /// Metadata as transport headers, for sinks that keep `raw` as the body.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("sourceTopic", self.source_topic.clone()),
            ("finalErrorKind", self.final_error_kind.as_str().to_string()),
            ("finalErrorMessage", self.final_error_message.clone()),
            ("attemptsMade", self.attempts_made.to_string()),
            ("deadLetteredAt", self.dead_lettered_at.to_rfc3339()),
        ];
        if let Some(message_id) = &self.message_id {
            headers.push(("messageId", message_id.clone()));
        }
        headers
    }
}

/// Serializable metadata of a dead-letter record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMetadata {
    /// Message id, if known
    pub message_id: Option<String>,
    /// Source topic
    pub source_topic: String,
    /// Final error kind name (e.g. `PermanentDispatchError`)
    pub final_error_kind: String,
    /// Final error message
    pub final_error_message: String,
    /// Attempts made
    pub attempts_made: u32,
    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

/// Failure to durably write a dead-letter record.
///
/// Never classified by the retry policy: the consumer leaves the source
/// message unacknowledged instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkWriteError {
    /// The sink could not be reached
    #[error("Dead-letter sink unavailable: {0}")]
    Unavailable(String),

    /// The sink refused the record
    #[error("Dead-letter sink rejected record: {0}")]
    Rejected(String),
}

/// Durable destination for dead-letter records.
///
/// `write` resolves only after the record is durable. Implementations must be
/// safe to call repeatedly for the same message: at-least-once delivery means
/// a message may be dead-lettered more than once.
pub trait DeadLetterSink: Send + Sync {
    /// Durably store a record.
    ///
    /// # Errors
    ///
    /// Returns [`SinkWriteError`] if the record could not be stored.
    fn write<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), SinkWriteError>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> DeadLetterRecord {
        DeadLetterRecord::new(
            b"{oops".to_vec(),
            "reservation-created",
            &ProcessingFailure::new(ErrorKind::Decode, "expected value at line 1"),
            1,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn attempts_made_is_at_least_one() {
        let record = DeadLetterRecord::new(
            Vec::new(),
            "t",
            &ProcessingFailure::new(ErrorKind::Decode, "x"),
            0,
            Utc::now(),
        );
        assert_eq!(record.attempts_made, 1);
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let json = serde_json::to_value(record().with_message_id(Some("m1".into())).metadata()).unwrap();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["sourceTopic"], "reservation-created");
        assert_eq!(json["finalErrorKind"], "DecodeError");
        assert_eq!(json["attemptsMade"], 1);
    }

    #[test]
    fn headers_omit_unknown_message_id() {
        let headers = record().headers();
        assert!(headers.iter().all(|(k, _)| *k != "messageId"));
        assert!(headers.contains(&("finalErrorKind", "DecodeError".to_string())));
    }
}
