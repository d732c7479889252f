//! Message envelope: delivery metadata plus payload.
//!
//! Every message on the bus is a JSON object of the form
//!
//! ```text
//! {
//!   "messageId": "m1",
//!   "type": "ReservationConfirmed",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "correlationId": "c1" | null,
//!   "causationId": "m0" | null,
//!   "payload": { ... }
//! }
//! ```
//!
//! [`Envelope::parse`] turns raw bytes into an [`Envelope<GenericPayload>`].
//! The payload stays generic until the normalizer in [`crate::event`] resolves
//! it into a typed [`DomainEvent`].
//!
//! Decode failures are permanent: the bytes will not change on redelivery, so
//! the pipeline dead-letters them without consuming a retry.

use crate::event::DomainEvent;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while decoding raw bytes into an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not well-formed JSON.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// The bytes are JSON, but not an object.
    #[error("Envelope must be a JSON object")]
    NotAnObject,

    /// A required metadata field is absent, null, empty or not a string.
    #[error("Envelope is missing required field '{0}'")]
    MissingField(&'static str),

    /// The timestamp is present but not an ISO-8601 instant.
    #[error("Invalid envelope timestamp '{value}': {reason}")]
    InvalidTimestamp {
        /// The raw value found in the envelope
        value: String,
        /// Why it could not be parsed
        reason: String,
    },
}

/// Canonical message wrapper.
///
/// `messageId` is assigned by the producer and is stable across redeliveries,
/// so it can be used as a deduplication key by side-effect owners.
///
/// # Type Parameter
///
/// * `T` - The payload: [`GenericPayload`] right after decoding, a typed
///   [`DomainEvent`] after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Unique message identifier assigned by the producer
    pub message_id: String,

    /// Discriminator naming the logical event (e.g. `ReservationCreated`)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producer-side creation instant
    pub timestamp: DateTime<Utc>,

    /// Links the messages of one causal chain
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Identifier of the message that caused this one
    #[serde(default)]
    pub causation_id: Option<String>,

    /// Event payload
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(message_id: impl Into<String>, event_type: impl Into<String>, payload: T) -> Self {
        Self {
            message_id: message_id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Set the producer timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Transform the payload, keeping all metadata.
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            message_id: self.message_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: f(self.payload),
        }
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be represented as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error>
    where
        T: Serialize,
    {
        serde_json::to_vec(self)
    }
}

/// Payload as seen before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericPayload {
    /// Decoded from the wire as a generic JSON value.
    Json(Value),
    /// Already typed by an in-process producer.
    Typed(DomainEvent),
}

impl Serialize for GenericPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Json(value) => value.serialize(serializer),
            Self::Typed(event) => event.details().serialize(serializer),
        }
    }
}

impl From<Envelope<DomainEvent>> for Envelope<GenericPayload> {
    fn from(envelope: Envelope<DomainEvent>) -> Self {
        envelope.map_payload(GenericPayload::Typed)
    }
}

impl Envelope<GenericPayload> {
    /// Decode raw bus bytes into an envelope with a generic payload.
    ///
    /// `messageId`, `type` and `timestamp` are required. `correlationId` and
    /// `causationId` are optional. A missing `payload` decodes to JSON `null`
    /// and is rejected later by the normalizer.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the bytes are not a JSON object or a
    /// required metadata field is missing or malformed.
    ///
    /// # Examples
    ///
    /// ```
    /// use notification_relay_core::envelope::{DecodeError, Envelope};
    ///
    /// assert!(matches!(
    ///     Envelope::parse(b"{not json"),
    ///     Err(DecodeError::Malformed(_))
    /// ));
    /// assert_eq!(
    ///     Envelope::parse(br#"{"type": "ReservationCreated"}"#),
    ///     Err(DecodeError::MissingField("messageId"))
    /// );
    /// ```
    pub fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let message_id = required_string(&object, "messageId")?;
        let event_type = required_string(&object, "type")?;
        let timestamp = required_timestamp(&object, "timestamp")?;
        let correlation_id = optional_string(&object, "correlationId");
        let causation_id = optional_string(&object, "causationId");
        let payload = object.remove("payload").unwrap_or(Value::Null);

        Ok(Self {
            message_id,
            event_type,
            timestamp,
            correlation_id,
            causation_id,
            payload: GenericPayload::Json(payload),
        })
    }
}

fn required_string(object: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match object.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(DecodeError::MissingField(field)),
    }
}

fn optional_string(object: &Map<String, Value>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn required_timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => parse_instant(s),
        Some(other) => Err(DecodeError::InvalidTimestamp {
            value: other.to_string(),
            reason: "expected an ISO-8601 string".to_string(),
        }),
    }
}

/// Accepts RFC 3339 instants and zone-less ISO-8601 date-times (read as UTC).
fn parse_instant(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeError::InvalidTimestamp {
            value: s.to_string(),
            reason: e.to_string(),
        })
}
