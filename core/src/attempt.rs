//! Delivery attempt tracking.
//!
//! The transport is stateless between retries, so the attempt count travels
//! with the message itself as headers. A message without headers is on its
//! first attempt.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Transport headers attached to a message.
pub type Headers = BTreeMap<String, String>;

/// Attempt number of the delivery (1-based).
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// When the pipeline first saw the message (RFC 3339).
pub const FIRST_SEEN_HEADER: &str = "x-first-seen-at";
/// Error message of the previous attempt.
pub const LAST_ERROR_HEADER: &str = "x-last-error";
/// Earliest instant the redelivery may be processed (RFC 3339).
pub const NOT_BEFORE_HEADER: &str = "x-not-before";
/// Topic the message was originally consumed from.
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";

/// Per-delivery attempt state.
///
/// Not persisted on its own: it lives for the duration of one processing run
/// and is reconstructed from headers on redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// Attempt number, starting at 1
    pub attempt_number: u32,
    /// When the first attempt was observed
    pub first_seen_at: DateTime<Utc>,
    /// Error that caused the previous attempt to fail
    pub last_error: Option<String>,
    /// Redeliveries must not be processed before this instant
    pub not_before: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// The first attempt of a message seen at `now`.
    #[must_use]
    pub const fn first(now: DateTime<Utc>) -> Self {
        Self {
            attempt_number: 1,
            first_seen_at: now,
            last_error: None,
            not_before: None,
        }
    }

    /// The attempt that follows this one after a failure.
    #[must_use]
    pub fn next(&self, error: impl Into<String>, not_before: DateTime<Utc>) -> Self {
        Self {
            attempt_number: self.attempt_number.saturating_add(1),
            first_seen_at: self.first_seen_at,
            last_error: Some(error.into()),
            not_before: Some(not_before),
        }
    }

    /// Reconstruct the attempt from transport headers.
    ///
    /// A missing or unparsable attempt header means attempt 1; a missing
    /// first-seen header defaults to `now`.
    #[must_use]
    pub fn from_headers(headers: &Headers, now: DateTime<Utc>) -> Self {
        let attempt_number = headers
            .get(ATTEMPT_HEADER)
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(1);

        Self {
            attempt_number,
            first_seen_at: headers
                .get(FIRST_SEEN_HEADER)
                .and_then(|s| parse_instant(s))
                .unwrap_or(now),
            last_error: headers.get(LAST_ERROR_HEADER).cloned(),
            not_before: headers.get(NOT_BEFORE_HEADER).and_then(|s| parse_instant(s)),
        }
    }

    /// Write this attempt into transport headers, replacing previous values.
    pub fn write_headers(&self, headers: &mut Headers) {
        headers.insert(ATTEMPT_HEADER.to_string(), self.attempt_number.to_string());
        headers.insert(FIRST_SEEN_HEADER.to_string(), self.first_seen_at.to_rfc3339());
        match &self.last_error {
            Some(error) => {
                headers.insert(LAST_ERROR_HEADER.to_string(), error.clone());
            },
            None => {
                headers.remove(LAST_ERROR_HEADER);
            },
        }
        match self.not_before {
            Some(not_before) => {
                headers.insert(NOT_BEFORE_HEADER.to_string(), not_before.to_rfc3339());
            },
            None => {
                headers.remove(NOT_BEFORE_HEADER);
            },
        }
    }

    /// How long to wait before this attempt may run, if at all.
    #[must_use]
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.not_before
            .and_then(|not_before| (not_before - now).to_std().ok())
            .filter(|delay| !delay.is_zero())
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn no_headers_means_first_attempt() {
        let attempt = DeliveryAttempt::from_headers(&Headers::new(), t0());
        assert_eq!(attempt, DeliveryAttempt::first(t0()));
    }

    #[test]
    fn garbage_attempt_header_means_first_attempt() {
        let mut headers = Headers::new();
        headers.insert(ATTEMPT_HEADER.to_string(), "zero".to_string());
        assert_eq!(DeliveryAttempt::from_headers(&headers, t0()).attempt_number, 1);

        headers.insert(ATTEMPT_HEADER.to_string(), "0".to_string());
        assert_eq!(DeliveryAttempt::from_headers(&headers, t0()).attempt_number, 1);
    }

    #[test]
    fn next_attempt_survives_header_transport() {
        let later = t0() + chrono::Duration::seconds(5);
        let next = DeliveryAttempt::first(t0()).next("dispatcher unavailable", later);

        let mut headers = Headers::new();
        next.write_headers(&mut headers);
        let restored = DeliveryAttempt::from_headers(&headers, later);

        assert_eq!(restored.attempt_number, 2);
        assert_eq!(restored.first_seen_at, t0());
        assert_eq!(restored.last_error.as_deref(), Some("dispatcher unavailable"));
        assert_eq!(restored.not_before, Some(later));
    }

    #[test]
    fn remaining_delay_is_none_once_due() {
        let due = t0() + chrono::Duration::milliseconds(1500);
        let attempt = DeliveryAttempt::first(t0()).next("boom", due);

        assert_eq!(attempt.remaining_delay(t0()), Some(Duration::from_millis(1500)));
        assert_eq!(attempt.remaining_delay(due), None);
        assert_eq!(attempt.remaining_delay(due + chrono::Duration::seconds(1)), None);
        assert_eq!(DeliveryAttempt::first(t0()).remaining_delay(t0()), None);
    }
}
