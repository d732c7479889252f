//! # Notification Relay Core
//!
//! Core types and capability traits for the reservation notification relay.
//!
//! The relay consumes reservation lifecycle events from a message bus and turns
//! each one into a notification. This crate holds everything that is pure or
//! transport-agnostic:
//!
//! - **Envelope**: delivery metadata plus an opaque payload ([`envelope`])
//! - **Domain events**: the closed set of reservation events and the
//!   descriptors that normalise generic payloads into them ([`event`])
//! - **Error taxonomy**: transient vs. permanent classification ([`error`])
//! - **Delivery attempts**: attempt tracking carried in transport headers
//!   ([`attempt`])
//! - **Dead letters**: the terminal record and the sink trait ([`dead_letter`])
//! - **Capabilities**: the dispatcher, bus and retry scheduler seams
//!   ([`dispatcher`], [`transport`])
//!
//! ## Pipeline
//!
//! ```text
//! raw bytes ──parse──▶ Envelope<GenericPayload>
//!                          │
//!                      normalize
//!                          ▼
//!                  Envelope<DomainEvent> ──dispatch──▶ side effect
//! ```
//!
//! The runtime crate drives this pipeline; the redpanda and postgres crates
//! provide production transports and sinks.
//!
//! ## Example
//!
//! ```
//! use notification_relay_core::envelope::Envelope;
//! use notification_relay_core::event::{normalize, DomainEvent};
//!
//! let raw = br#"{
//!     "messageId": "m1",
//!     "type": "ReservationConfirmed",
//!     "timestamp": "2024-01-01T00:00:00Z",
//!     "payload": { "reservationId": "r1", "customerEmail": "a@b.com" }
//! }"#;
//!
//! let envelope = Envelope::parse(raw).unwrap();
//! let typed = normalize(envelope).unwrap();
//! assert!(matches!(typed.payload, DomainEvent::ReservationConfirmed(_)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod attempt;
pub mod dead_letter;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod event;
pub mod topics;
pub mod transport;

/// Environment module - injected dependencies
///
/// All time lookups in the pipeline go through [`environment::Clock`] so that
/// attempt timestamps and dead-letter records are deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use notification_relay_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Boxed future returned by the dyn-compatible capability traits.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
