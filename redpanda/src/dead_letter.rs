//! Dead-letter topic `{topic}-dlt`.

use crate::publisher::KafkaPublisher;
use notification_relay_core::BoxFuture;
use notification_relay_core::dead_letter::{DeadLetterRecord, DeadLetterSink, SinkWriteError};
use notification_relay_core::topics;

/// Dead-letter sink that publishes to the dead-letter topic of the source.
///
/// The record body is the original raw bytes; metadata travels as headers
/// (`sourceTopic`, `finalErrorKind`, `finalErrorMessage`, `attemptsMade`,
/// `deadLetteredAt`, `messageId`). Kafka topics are append-only and accept
/// duplicates, which matches the sink contract.
#[derive(Clone)]
pub struct KafkaDeadLetterSink {
    publisher: KafkaPublisher,
}

impl KafkaDeadLetterSink {
    /// Create a sink on top of a shared publisher.
    #[must_use]
    pub const fn new(publisher: KafkaPublisher) -> Self {
        Self { publisher }
    }
}

impl DeadLetterSink for KafkaDeadLetterSink {
    fn write<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), SinkWriteError>> {
        Box::pin(async move {
            let topic = topics::dead_letter_topic(&record.source_topic);
            let headers = record.headers();
            let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();

            self.publisher
                .publish(
                    &topic,
                    record.message_id.as_deref().map(str::as_bytes),
                    &record.raw,
                    &headers,
                )
                .await
                .map(|_| ())
                .map_err(|e| SinkWriteError::Unavailable(e.to_string()))
        })
    }
}
