//! Topic naming for the retry lane and the dead-letter stream.
//!
//! For a subscribed topic `reservation-created`:
//!
//! - `reservation-created-retry` carries delayed redeliveries
//! - `reservation-created-dlt` receives dead-lettered messages

/// Suffix of the retry lane topic.
pub const RETRY_SUFFIX: &str = "-retry";

/// Suffix of the dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = "-dlt";

/// The retry lane topic of a source topic.
#[must_use]
pub fn retry_topic(topic: &str) -> String {
    format!("{}{RETRY_SUFFIX}", source_topic(topic))
}

/// The dead-letter topic of a source topic.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{DEAD_LETTER_SUFFIX}", source_topic(topic))
}

/// Whether the topic is a retry lane.
#[must_use]
pub fn is_retry_topic(topic: &str) -> bool {
    topic.ends_with(RETRY_SUFFIX)
}

/// The source topic a retry lane belongs to (identity for source topics).
#[must_use]
pub fn source_topic(topic: &str) -> &str {
    topic.strip_suffix(RETRY_SUFFIX).unwrap_or(topic)
}
