//! Kafka-compatible transport for the notification relay.
//!
//! This crate provides the production implementations of the transport
//! seams from `notification-relay-core`, built on rdkafka:
//!
//! - [`KafkaMessageBus`]: a manual-commit consumer ([`MessageBus`])
//! - [`KafkaRetryScheduler`]: the `{topic}-retry` lane ([`RetryScheduler`])
//! - [`KafkaDeadLetterSink`]: the `{topic}-dlt` dead-letter topic
//!
//! It works against Redpanda, Apache Kafka or any other Kafka-protocol
//! broker.
//!
//! # Architecture
//!
//! ```text
//! reservation-created ─────┐
//! reservation-created-retry┼──▶ StreamConsumer ──▶ forwarder task ──▶ MessageStream
//!                          │    (manual commit)      (mpsc buffer)
//!                          │
//!   acknowledge ───────────┼──▶ commit(offset + 1)
//!   release ───────────────┘──▶ seek(offset)
//!
//!   KafkaRetryScheduler ──▶ FutureProducer ──▶ reservation-created-retry
//!   KafkaDeadLetterSink ──▶ FutureProducer ──▶ reservation-created-dlt
//! ```
//!
//! # Delivery guarantees
//!
//! - **At-least-once**: offsets are committed only after processing settles
//! - **Ordered within partition**: one consumer per group member, one worker
//!   per partition downstream
//! - **Topic creation is not managed here**: retry and dead-letter topics
//!   must exist or the broker must auto-create them
//!
//! # Example
//!
//! ```no_run
//! use notification_relay_core::transport::MessageBus;
//! use notification_relay_redpanda::KafkaMessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("notification-group")
//!     .build()?;
//!
//! let scheduler = bus.retry_scheduler();
//! let sink = bus.dead_letter_sink();
//! let stream = bus
//!     .subscribe(&["reservation-created".to_string(), "reservation-created-retry".to_string()])
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter;
mod publisher;
mod retry;

pub use dead_letter::KafkaDeadLetterSink;
pub use publisher::KafkaPublisher;
pub use retry::KafkaRetryScheduler;

use notification_relay_core::BoxFuture;
use notification_relay_core::attempt::Headers;
use notification_relay_core::transport::{InboundMessage, MessageBus, MessageStream, TransportError};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers as _, Message};
use rdkafka::producer::FutureProducer;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Kafka-backed message bus with manual offset commits.
///
/// Owns one consumer (one group member) and one producer. The producer is
/// shared with the retry scheduler and dead-letter sink created from this
/// bus.
pub struct KafkaMessageBus {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    brokers: String,
    consumer_group: String,
    timeout: Duration,
    buffer_size: usize,
}

impl KafkaMessageBus {
    /// Create a new bus builder.
    #[must_use]
    pub fn builder() -> KafkaMessageBusBuilder {
        KafkaMessageBusBuilder::default()
    }

    /// Get the broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Get the consumer group id.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// A publisher sharing this bus's producer.
    #[must_use]
    pub fn publisher(&self) -> KafkaPublisher {
        KafkaPublisher::new(self.producer.clone(), self.timeout)
    }

    /// A retry scheduler sharing this bus's producer.
    #[must_use]
    pub fn retry_scheduler(&self) -> KafkaRetryScheduler {
        KafkaRetryScheduler::new(self.publisher())
    }

    /// A dead-letter sink sharing this bus's producer.
    #[must_use]
    pub fn dead_letter_sink(&self) -> KafkaDeadLetterSink {
        KafkaDeadLetterSink::new(self.publisher())
    }
}

/// Builder for [`KafkaMessageBus`].
#[derive(Default)]
pub struct KafkaMessageBusBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaMessageBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group id (default: `notification-group`).
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set producer acknowledgement mode (default: `all`).
    ///
    /// Retry and dead-letter records gate the commit of the source message,
    /// so they are written with full acknowledgement by default.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the timeout for publishing and seeking (default: 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer session timeout (default: 6 seconds).
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set the buffer between the consumer and the runtime (default: 1000).
    ///
    /// Zero is treated as 1.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set where a new consumer group starts (default: `earliest`).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`KafkaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if brokers are not
    /// configured or the consumer or producer cannot be created.
    pub fn build(self) -> Result<KafkaMessageBus, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| "notification-group".to_string());
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(6));
        let buffer_size = self.buffer_size.unwrap_or(1000).max(1);

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        // Manual commit for at-least-once
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create consumer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            consumer_group = %consumer_group,
            acks = %acks,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "KafkaMessageBus created successfully"
        );

        Ok(KafkaMessageBus {
            consumer: Arc::new(consumer),
            producer,
            brokers,
            consumer_group,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size,
        })
    }
}

/// Copy a borrowed Kafka message into an owned [`InboundMessage`].
///
/// Header values are decoded as UTF-8 (lossily); valueless headers are
/// dropped.
fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let mut headers = Headers::new();
    if let Some(kafka_headers) = message.headers() {
        for header in kafka_headers.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), String::from_utf8_lossy(value).into_owned());
            }
        }
    }

    InboundMessage::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    )
    .with_key(message.key().map(<[u8]>::to_vec))
    .with_headers(headers)
}

impl MessageBus for KafkaMessageBus {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, Result<MessageStream, TransportError>> {
        Box::pin(async move {
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer
                .subscribe(&topic_refs)
                .map_err(|e| TransportError::SubscriptionFailed {
                    topics: topics.to_vec(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %self.consumer_group,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let consumer = Arc::clone(&self.consumer);

            // Forwarder owns a consumer handle; commits happen on acknowledge.
            tokio::spawn(async move {
                loop {
                    let received = tokio::select! {
                        () = tx.closed() => break,
                        received = consumer.recv() => received,
                    };

                    let item = match received {
                        Ok(message) => {
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received message"
                            );
                            Ok(to_inbound(&message))
                        },
                        Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
                    };

                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn acknowledge<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let commit_failed = |reason: String| TransportError::CommitFailed {
                partition: message.partition_id(),
                offset: message.offset,
                reason,
            };

            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
                .map_err(|e| commit_failed(e.to_string()))?;
            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| commit_failed(e.to_string()))
        })
    }

    fn release<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.consumer);
            let topic = message.topic.clone();
            let (partition, offset) = (message.partition, message.offset);
            let timeout = self.timeout;

            // seek blocks until librdkafka has purged the fetch queue
            let sought = tokio::task::spawn_blocking(move || {
                consumer.seek(&topic, partition, Offset::Offset(offset), Timeout::After(timeout))
            })
            .await;

            let reason = match sought {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            Err(TransportError::SeekFailed {
                partition: message.partition_id(),
                offset,
                reason,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_message_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaMessageBus>();
        assert_sync::<KafkaMessageBus>();
        assert_send::<KafkaRetryScheduler>();
        assert_sync::<KafkaDeadLetterSink>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = KafkaMessageBus::builder().consumer_group("g").build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
