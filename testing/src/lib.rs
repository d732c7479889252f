//! # Notification Relay Testing
//!
//! Testing utilities and in-memory collaborators for the notification relay.
//!
//! This crate provides:
//! - A fixed clock for deterministic timestamps
//! - [`InMemoryBus`]: a log-structured bus with Kafka-like commit and rewind
//! - [`InMemoryDeadLetterSink`]: a sink with an outage switch
//! - [`ScriptedDispatcher`]: queued dispatch results and a call log
//! - Envelope fixtures and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use notification_relay_testing::{helpers, test_clock, InMemoryBus, InMemoryDeadLetterSink, ScriptedDispatcher};
//!
//! #[tokio::test]
//! async fn test_confirmed_reservation_is_acknowledged() {
//!     let bus = InMemoryBus::default();
//!     bus.publish(
//!         "reservation-confirmed",
//!         Some("r1"),
//!         helpers::reservation_envelope("m1", "ReservationConfirmed", "r1", "a@b.com"),
//!     );
//!     // build a MessageProcessor from the collaborators and process
//! }
//! ```

use chrono::{DateTime, Utc};
use notification_relay_core::environment::Clock;

pub mod bus;
pub mod dead_letter;
pub mod dispatcher;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeZone;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use notification_relay_testing::mocks::FixedClock;
    /// use notification_relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2024-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    }
}

/// Envelope fixtures and tracing setup.
pub mod helpers {
    use serde_json::{Value, json};

    /// Raw bytes of an envelope with an arbitrary payload.
    #[must_use]
    pub fn envelope_json(message_id: &str, event_type: &str, payload: &Value) -> Vec<u8> {
        json!({
            "messageId": message_id,
            "type": event_type,
            "timestamp": "2024-01-01T00:00:00Z",
            "correlationId": null,
            "causationId": null,
            "payload": payload,
        })
        .to_string()
        .into_bytes()
    }

    /// Raw bytes of a well-formed reservation event envelope.
    #[must_use]
    pub fn reservation_envelope(message_id: &str, event_type: &str, reservation_id: &str, email: &str) -> Vec<u8> {
        envelope_json(
            message_id,
            event_type,
            &json!({ "reservationId": reservation_id, "customerEmail": email }),
        )
    }

    /// Install a test tracing subscriber honouring `RUST_LOG`.
    ///
    /// Safe to call from many tests; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies for envelopes and events.
pub mod properties {
    use notification_relay_core::event::{DomainEvent, ReservationDetails};
    use proptest::prelude::*;

    /// Arbitrary reservation details with a plausible email.
    pub fn arb_details() -> impl Strategy<Value = ReservationDetails> {
        ("[a-z0-9-]{1,16}", "[a-z]{1,8}@[a-z]{1,8}\\.(com|org|net)")
            .prop_map(|(id, email)| ReservationDetails::new(id, email))
    }

    /// Arbitrary domain event.
    pub fn arb_domain_event() -> impl Strategy<Value = DomainEvent> {
        prop_oneof![
            arb_details().prop_map(DomainEvent::ReservationCreated),
            arb_details().prop_map(DomainEvent::ReservationConfirmed),
            arb_details().prop_map(DomainEvent::ReservationCancelled),
        ]
    }

    /// Arbitrary message id.
    pub fn arb_message_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9-]{1,24}"
    }

    /// Bytes that are not a JSON object.
    pub fn arb_malformed_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..64).prop_filter("must not be a JSON object", |bytes| {
            serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes).is_err()
        })
    }
}

pub use bus::InMemoryBus;
pub use dead_letter::InMemoryDeadLetterSink;
pub use dispatcher::ScriptedDispatcher;
pub use mocks::{FixedClock, test_clock};
