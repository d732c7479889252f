//! The dispatcher capability: the side effect performed for each event.

use crate::envelope::Envelope;
use crate::error::ErrorKind;
use crate::event::DomainEvent;
use crate::BoxFuture;
use thiserror::Error;

/// Why a dispatch failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The downstream is temporarily unavailable; retrying may succeed
    #[error("Transient dispatch failure: {0}")]
    Transient(String),

    /// The event was rejected; retrying reproduces the failure
    #[error("Permanent dispatch failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    /// The error kind this failure maps to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientDispatch,
            Self::Permanent(_) => ErrorKind::PermanentDispatch,
        }
    }
}

/// Performs the side effect for a normalised event.
///
/// Dispatch is at-least-once: the same envelope may be dispatched more than
/// once, and implementations should use `message_id` to deduplicate.
///
/// # Example
///
/// ```
/// use notification_relay_core::dispatcher::{DispatchError, Dispatcher};
/// use notification_relay_core::envelope::Envelope;
/// use notification_relay_core::event::DomainEvent;
/// use notification_relay_core::BoxFuture;
///
/// struct Discard;
///
/// impl Dispatcher for Discard {
///     fn dispatch<'a>(
///         &'a self,
///         _envelope: &'a Envelope<DomainEvent>,
///     ) -> BoxFuture<'a, Result<(), DispatchError>> {
///         Box::pin(async { Ok(()) })
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync {
    /// Dispatch one event.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Transient`] when the call may succeed later
    /// and [`DispatchError::Permanent`] when the event is invalid.
    fn dispatch<'a>(&'a self, envelope: &'a Envelope<DomainEvent>) -> BoxFuture<'a, Result<(), DispatchError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_dispatch_kinds() {
        assert_eq!(DispatchError::Transient("x".into()).kind(), ErrorKind::TransientDispatch);
        assert_eq!(DispatchError::Permanent("x".into()).kind(), ErrorKind::PermanentDispatch);
    }
}
