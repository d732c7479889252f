//! Retry lane on `{topic}-retry`.

use crate::publisher::KafkaPublisher;
use notification_relay_core::BoxFuture;
use notification_relay_core::attempt::{DeliveryAttempt, ORIGINAL_TOPIC_HEADER};
use notification_relay_core::topics;
use notification_relay_core::transport::{InboundMessage, RetryScheduler, TransportError};

/// Publishes delayed redeliveries to the retry topic of the source topic.
///
/// The redelivery keeps the original bytes and key (so it lands on a
/// consistent retry partition) and carries the attempt headers. The
/// partition worker of the retry topic holds it until `x-not-before`.
#[derive(Clone)]
pub struct KafkaRetryScheduler {
    publisher: KafkaPublisher,
}

impl KafkaRetryScheduler {
    /// Create a scheduler on top of a shared publisher.
    #[must_use]
    pub const fn new(publisher: KafkaPublisher) -> Self {
        Self { publisher }
    }
}

impl RetryScheduler for KafkaRetryScheduler {
    fn schedule<'a>(
        &'a self,
        message: &'a InboundMessage,
        attempt: &'a DeliveryAttempt,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let source = message.source_topic();
            let retry_topic = topics::retry_topic(source);

            let mut headers = message.headers.clone();
            attempt.write_headers(&mut headers);
            headers.insert(ORIGINAL_TOPIC_HEADER.to_string(), source.to_string());
            let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

            let (partition, offset) = self
                .publisher
                .publish(&retry_topic, message.key.as_deref(), &message.payload, &headers)
                .await?;

            tracing::debug!(
                retry_topic = %retry_topic,
                partition,
                offset,
                attempt = attempt.attempt_number,
                "Redelivery scheduled"
            );
            Ok(())
        })
    }
}
