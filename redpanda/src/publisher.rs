//! Shared producer for the retry lane and the dead-letter topic.

use notification_relay_core::transport::TransportError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Publishes raw records and waits for the broker acknowledgement.
///
/// Cheap to clone: clones share one underlying producer.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Wrap a producer.
    #[must_use]
    pub const fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }

    /// Publish one record; resolves to its partition and offset once the
    /// broker has acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if delivery fails or times out.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), TransportError> {
        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for &(key, value) in headers {
            owned_headers = owned_headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic)
            .payload(payload)
            .headers(owned_headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Record published successfully"
                );
                Ok((partition, offset))
            },
            Err((kafka_error, _)) => {
                tracing::error!(
                    topic = %topic,
                    error = %kafka_error,
                    "Failed to publish record"
                );
                Err(TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            },
        }
    }
}
