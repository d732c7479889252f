//! Failure classification for the consumption pipeline.
//!
//! Every failure the pipeline can observe while handling a message falls into
//! one of two classes:
//!
//! - **Transient**: the collaborator was temporarily unavailable; the same
//!   message may succeed later and is retried with backoff.
//! - **Permanent**: the message itself is wrong (bad bytes, bad shape, rejected
//!   by validation); retrying reproduces the error, so it escalates to the
//!   dead-letter sink immediately.
//!
//! Dead-letter write failures are not an [`ErrorKind`]: they
//! are never fed to the retry policy (see
//! [`SinkWriteError`](crate::dead_letter::SinkWriteError)).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a failure can heal by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Expected to resolve if retried later.
    Transient,
    /// Retrying the same bytes reproduces the failure.
    Permanent,
}

/// The kind of failure that ended (or interrupted) processing of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The raw bytes are not a well-formed envelope.
    Decode,
    /// The payload does not have the shape of the declared event type.
    Normalization,
    /// The dispatcher is temporarily unavailable.
    TransientDispatch,
    /// The dispatcher rejected the event as invalid.
    PermanentDispatch,
}

impl ErrorKind {
    /// Classify this kind.
    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::TransientDispatch => ErrorClass::Transient,
            Self::Decode | Self::Normalization | Self::PermanentDispatch => ErrorClass::Permanent,
        }
    }

    /// Whether the retry policy may schedule another attempt for this kind.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Stable name written as `finalErrorKind` on dead-letter records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "DecodeError",
            Self::Normalization => "NormalizationError",
            Self::TransientDispatch => "TransientDispatchError",
            Self::PermanentDispatch => "PermanentDispatchError",
        }
    }

    /// Parse a stored `finalErrorKind` back into a kind.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DecodeError" => Some(Self::Decode),
            "NormalizationError" => Some(Self::Normalization),
            "TransientDispatchError" => Some(Self::TransientDispatch),
            "PermanentDispatchError" => Some(Self::PermanentDispatch),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: its kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFailure {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Diagnostic message, recorded on the dead-letter record.
    pub message: String,
}

impl ProcessingFailure {
    /// Create a new failure.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<crate::envelope::DecodeError> for ProcessingFailure {
    fn from(err: crate::envelope::DecodeError) -> Self {
        Self::new(ErrorKind::Decode, err.to_string())
    }
}

impl From<crate::event::NormalizationError> for ProcessingFailure {
    fn from(err: crate::event::NormalizationError) -> Self {
        Self::new(ErrorKind::Normalization, err.to_string())
    }
}

impl From<crate::dispatcher::DispatchError> for ProcessingFailure {
    fn from(err: crate::dispatcher::DispatchError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
