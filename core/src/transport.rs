//! Transport abstraction: where messages come from and how they are settled.
//!
//! The pipeline consumes from a partitioned log (Kafka/Redpanda in
//! production, an in-memory log in tests). Each delivered message is settled
//! exactly one way:
//!
//! - [`MessageBus::acknowledge`]: processing reached a terminal state; the
//!   consumer position moves past the message
//! - [`MessageBus::release`]: processing could not complete (dead-letter sink
//!   down); the partition rewinds so the message is delivered again
//!
//! Delayed retries do not block the source partition. They are published to
//! the retry lane through a [`RetryScheduler`] and the source message is then
//! acknowledged.
//!
//! # Delivery guarantees
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **Ordered within a partition**: the runtime processes one message per
//!   partition at a time
//! - **Parallel across partitions**: partitions are independent

use crate::attempt::{DeliveryAttempt, Headers, ORIGINAL_TOPIC_HEADER};
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit a consumer position
    #[error("Commit failed for {partition} at offset {offset}: {reason}")]
    CommitFailed {
        /// The partition being committed
        partition: PartitionId,
        /// The offset of the acknowledged message
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Failed to rewind a partition
    #[error("Seek failed for {partition} to offset {offset}: {reason}")]
    SeekFailed {
        /// The partition being rewound
        partition: PartitionId,
        /// The offset to rewind to
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Failed to receive the next message
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// A topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl PartitionId {
    /// Create a partition id.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partition key
    pub key: Option<Vec<u8>>,
    /// Raw message bytes
    pub payload: Vec<u8>,
    /// Transport headers
    pub headers: Headers,
}

impl InboundMessage {
    /// Create a message without key or headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload,
            headers: Headers::new(),
        }
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.key = key;
        self
    }

    /// Replace the headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// The partition this message belongs to.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        PartitionId::new(self.topic.clone(), self.partition)
    }

    /// The delivery attempt this message represents.
    #[must_use]
    pub fn attempt(&self, now: DateTime<Utc>) -> DeliveryAttempt {
        DeliveryAttempt::from_headers(&self.headers, now)
    }

    /// The topic the message was originally published to.
    ///
    /// Retry lane messages carry it in a header; otherwise it is derived from
    /// the topic name.
    #[must_use]
    pub fn source_topic(&self) -> &str {
        self.headers
            .get(ORIGINAL_TOPIC_HEADER)
            .map_or_else(|| crate::topics::source_topic(&self.topic), String::as_str)
    }
}

/// Stream of messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, TransportError>> + Send>>;

/// A partitioned, at-least-once message source.
pub trait MessageBus: Send + Sync {
    /// Subscribe to topics.
    ///
    /// Messages from all assigned partitions are merged into one stream;
    /// order is preserved within each partition.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if the subscription
    /// could not be established.
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, Result<MessageStream, TransportError>>;

    /// Move the consumer position past `message`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommitFailed`] if the position could not be
    /// stored.
    fn acknowledge<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Rewind the partition of `message` so it is delivered again.
    ///
    /// Messages of the same partition already in flight with a later offset
    /// are delivered again too; the consumer discards them until `message`
    /// comes back.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SeekFailed`] if the partition could not be
    /// rewound.
    fn release<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Publishes delayed redeliveries to the retry lane.
pub trait RetryScheduler: Send + Sync {
    /// Schedule `message` for redelivery as `attempt`.
    ///
    /// The redelivery carries the original bytes unchanged, the headers of
    /// `attempt`, and the source topic. It resolves once the redelivery is
    /// durable; only then may the source message be acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the redelivery could not
    /// be stored.
    fn schedule<'a>(
        &'a self,
        message: &'a InboundMessage,
        attempt: &'a DeliveryAttempt,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}
