//! Reservation domain events and the payload normalizer.
//!
//! The set of events is closed and dispatch is purely on the envelope `type`:
//!
//! | `type` | Variant |
//! |---|---|
//! | `ReservationCreated` | [`DomainEvent::ReservationCreated`] |
//! | `ReservationConfirmed` | [`DomainEvent::ReservationConfirmed`] |
//! | `ReservationCancelled` | [`DomainEvent::ReservationCancelled`] |
//!
//! Each type is described by a static [`EventDescriptor`] listing its required
//! fields and a pure conversion function. Normalization never looks at the
//! payload reflectively: a payload either already is the target variant (and
//! passes through untouched), or it is a JSON object converted field by field.
//!
//! Normalization failures are permanent.

use crate::envelope::{Envelope, GenericPayload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors produced while normalizing a generic payload into a domain event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    /// No descriptor exists for the envelope `type`.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload is null, an array or a scalar.
    #[error("Payload for {event_type} must be a JSON object")]
    NotAnObject {
        /// The event type being normalized
        event_type: String,
    },

    /// A required field is absent or null.
    #[error("Payload is missing required field '{0}'")]
    MissingField(&'static str),

    /// A required field is present with the wrong shape.
    #[error("Field '{field}' has an incompatible shape: expected {expected}")]
    IncompatibleShape {
        /// The offending field
        field: &'static str,
        /// The expected shape
        expected: &'static str,
    },

    /// A pre-typed payload does not match the envelope type.
    #[error("Payload is a {found} but the envelope declares {expected}")]
    TypeMismatch {
        /// The descriptor's event type
        expected: &'static str,
        /// The event type of the pre-typed payload
        found: &'static str,
    },
}

/// Fields shared by every reservation event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDetails {
    /// Reservation identifier
    pub reservation_id: String,
    /// Address to notify
    pub customer_email: String,
}

impl ReservationDetails {
    /// Create reservation details.
    #[must_use]
    pub fn new(reservation_id: impl Into<String>, customer_email: impl Into<String>) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            customer_email: customer_email.into(),
        }
    }
}

/// A strongly-typed reservation lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainEvent {
    /// A reservation was created and awaits confirmation.
    ReservationCreated(ReservationDetails),
    /// A reservation was confirmed.
    ReservationConfirmed(ReservationDetails),
    /// A reservation was cancelled.
    ReservationCancelled(ReservationDetails),
}

impl DomainEvent {
    /// The envelope `type` of this event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ReservationCreated(_) => RESERVATION_CREATED,
            Self::ReservationConfirmed(_) => RESERVATION_CONFIRMED,
            Self::ReservationCancelled(_) => RESERVATION_CANCELLED,
        }
    }

    /// The fields carried by the event.
    #[must_use]
    pub const fn details(&self) -> &ReservationDetails {
        match self {
            Self::ReservationCreated(details)
            | Self::ReservationConfirmed(details)
            | Self::ReservationCancelled(details) => details,
        }
    }

    /// Shortcut for `details().reservation_id`.
    #[must_use]
    pub fn reservation_id(&self) -> &str {
        &self.details().reservation_id
    }

    /// Shortcut for `details().customer_email`.
    #[must_use]
    pub fn customer_email(&self) -> &str {
        &self.details().customer_email
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ reservation: {} }}", self.event_type(), self.reservation_id())
    }
}

/// `type` of [`DomainEvent::ReservationCreated`].
pub const RESERVATION_CREATED: &str = "ReservationCreated";
/// `type` of [`DomainEvent::ReservationConfirmed`].
pub const RESERVATION_CONFIRMED: &str = "ReservationConfirmed";
/// `type` of [`DomainEvent::ReservationCancelled`].
pub const RESERVATION_CANCELLED: &str = "ReservationCancelled";

const RESERVATION_FIELDS: &[&str] = &["reservationId", "customerEmail"];

/// Declares one event type: its discriminator, required fields and the pure
/// conversion from a JSON object.
#[derive(Clone, Copy)]
pub struct EventDescriptor {
    /// Envelope `type` this descriptor handles
    pub event_type: &'static str,
    /// Payload fields that must be present
    pub required_fields: &'static [&'static str],
    convert: fn(&Map<String, Value>) -> Result<DomainEvent, NormalizationError>,
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("event_type", &self.event_type)
            .field("required_fields", &self.required_fields)
            .finish_non_exhaustive()
    }
}

impl EventDescriptor {
    /// Convert the envelope payload into this descriptor's event.
    ///
    /// A payload that is already the target variant is passed through
    /// unchanged. A JSON object is converted field by field. The envelope
    /// metadata is preserved as-is.
    ///
    /// # Errors
    ///
    /// Returns a [`NormalizationError`] when the payload is not an object, a
    /// required field is absent or has the wrong shape, or a pre-typed payload
    /// is a different variant.
    pub fn normalize(
        &self,
        envelope: Envelope<GenericPayload>,
    ) -> Result<Envelope<DomainEvent>, NormalizationError> {
        let Envelope {
            message_id,
            event_type,
            timestamp,
            correlation_id,
            causation_id,
            payload,
        } = envelope;

        let event = match payload {
            GenericPayload::Typed(event) if event.event_type() == self.event_type => event,
            GenericPayload::Typed(event) => {
                return Err(NormalizationError::TypeMismatch {
                    expected: self.event_type,
                    found: event.event_type(),
                });
            },
            GenericPayload::Json(Value::Object(object)) => (self.convert)(&object)?,
            GenericPayload::Json(_) => {
                return Err(NormalizationError::NotAnObject {
                    event_type: self.event_type.to_string(),
                });
            },
        };

        Ok(Envelope {
            message_id,
            event_type,
            timestamp,
            correlation_id,
            causation_id,
            payload: event,
        })
    }
}

/// Descriptors for every supported event type.
pub static DESCRIPTORS: [EventDescriptor; 3] = [
    EventDescriptor {
        event_type: RESERVATION_CREATED,
        required_fields: RESERVATION_FIELDS,
        convert: reservation_created,
    },
    EventDescriptor {
        event_type: RESERVATION_CONFIRMED,
        required_fields: RESERVATION_FIELDS,
        convert: reservation_confirmed,
    },
    EventDescriptor {
        event_type: RESERVATION_CANCELLED,
        required_fields: RESERVATION_FIELDS,
        convert: reservation_cancelled,
    },
];

fn reservation_created(object: &Map<String, Value>) -> Result<DomainEvent, NormalizationError> {
    reservation_details(object).map(DomainEvent::ReservationCreated)
}

fn reservation_confirmed(object: &Map<String, Value>) -> Result<DomainEvent, NormalizationError> {
    reservation_details(object).map(DomainEvent::ReservationConfirmed)
}

fn reservation_cancelled(object: &Map<String, Value>) -> Result<DomainEvent, NormalizationError> {
    reservation_details(object).map(DomainEvent::ReservationCancelled)
}

/// Look up the descriptor for an envelope `type`.
#[must_use]
pub fn descriptor_for(event_type: &str) -> Option<&'static EventDescriptor> {
    DESCRIPTORS.iter().find(|d| d.event_type == event_type)
}

/// Normalize an envelope using the descriptor named by its `type`.
///
/// # Errors
///
/// Returns [`NormalizationError::UnknownEventType`] when no descriptor exists,
/// or any error of [`EventDescriptor::normalize`].
pub fn normalize(
    envelope: Envelope<GenericPayload>,
) -> Result<Envelope<DomainEvent>, NormalizationError> {
    let descriptor = descriptor_for(&envelope.event_type)
        .ok_or_else(|| NormalizationError::UnknownEventType(envelope.event_type.clone()))?;
    descriptor.normalize(envelope)
}

fn reservation_details(object: &Map<String, Value>) -> Result<ReservationDetails, NormalizationError> {
    Ok(ReservationDetails {
        reservation_id: required_string(object, "reservationId")?,
        customer_email: required_string(object, "customerEmail")?,
    })
}

fn required_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<String, NormalizationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(NormalizationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(NormalizationError::IncompatibleShape {
            field,
            expected: "string",
        }),
    }
}
