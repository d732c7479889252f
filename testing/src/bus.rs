//! In-memory, log-structured message bus.
//!
//! Behaves like a Kafka consumer group with a single member:
//!
//! - topics are append-only logs split into a fixed number of partitions
//! - keyed messages always land on the same partition
//! - each partition has a delivery cursor and a committed position
//! - `acknowledge` commits `offset + 1`; `release` moves the cursor back so
//!   the message and everything after it are delivered again
//!
//! It also implements [`RetryScheduler`] by appending to the retry lane of
//! the source topic, so a whole pipeline can run against one instance.

use async_stream::stream;
use notification_relay_core::attempt::{DeliveryAttempt, Headers, ORIGINAL_TOPIC_HEADER};
use notification_relay_core::topics;
use notification_relay_core::transport::{
    InboundMessage, MessageBus, MessageStream, PartitionId, RetryScheduler, TransportError,
};
use notification_relay_core::BoxFuture;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<InboundMessage>,
    cursor: usize,
    committed: i64,
}

#[derive(Debug, Default)]
struct BusState {
    logs: BTreeMap<PartitionId, PartitionLog>,
    acknowledged: Vec<(PartitionId, i64)>,
    released: Vec<(PartitionId, i64)>,
    round_robin: usize,
    closed: bool,
}

impl BusState {
    fn next_message(&mut self, topics: &[String]) -> Option<InboundMessage> {
        let ready: Vec<PartitionId> = self
            .logs
            .iter()
            .filter(|(id, log)| topics.contains(&id.topic) && log.cursor < log.entries.len())
            .map(|(id, _)| id.clone())
            .collect();
        if ready.is_empty() {
            return None;
        }

        let id = &ready[self.round_robin % ready.len()];
        self.round_robin = self.round_robin.wrapping_add(1);
        let log = self.logs.get_mut(id)?;
        let message = log.entries.get(log.cursor).cloned();
        log.cursor += 1;
        message
    }
}

/// In-memory message bus for tests.
///
/// # Example
///
/// ```
/// use notification_relay_testing::InMemoryBus;
///
/// let bus = InMemoryBus::new(2);
/// let (partition, offset) = bus.publish("reservation-created", Some("r1"), b"{}".to_vec());
/// assert_eq!(offset, 0);
/// assert_eq!(bus.publish("reservation-created", Some("r1"), b"{}".to_vec()), (partition, 1));
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    partitions: i32,
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    fail_schedules: Arc<AtomicBool>,
}

impl InMemoryBus {
    /// Create a bus whose topics have `partitions` partitions (at least 1).
    #[must_use]
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(BusState::default())),
            notify: Arc::new(Notify::new()),
            fail_schedules: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The partition a key maps to.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn partition_for(&self, key: Option<&[u8]>) -> i32 {
        key.map_or(0, |key| {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % u64::from(self.partitions.unsigned_abs())) as i32
        })
    }

    /// Append a message; returns its partition and offset.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> (i32, i64) {
        self.publish_with_headers(topic, key.map(|k| k.as_bytes().to_vec()), payload.into(), Headers::new())
    }

    /// Append a message with headers; returns its partition and offset.
    pub fn publish_with_headers(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
        headers: Headers,
    ) -> (i32, i64) {
        let partition = self.partition_for(key.as_deref());
        let offset = {
            let mut state = self.state();
            let log = state
                .logs
                .entry(PartitionId::new(topic, partition))
                .or_default();
            let offset = i64::try_from(log.entries.len()).unwrap_or(i64::MAX);
            log.entries.push(
                InboundMessage::new(topic, partition, offset, payload)
                    .with_key(key)
                    .with_headers(headers),
            );
            offset
        };
        self.notify.notify_waiters();
        (partition, offset)
    }

    /// Every message ever appended to `topic`, ordered by partition then offset.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        self.state()
            .logs
            .iter()
            .filter(|(id, _)| id.topic == topic)
            .flat_map(|(_, log)| log.entries.iter().cloned())
            .collect()
    }

    /// Committed position of a partition (the next offset to consume).
    #[must_use]
    pub fn committed(&self, topic: &str, partition: i32) -> i64 {
        self.state()
            .logs
            .get(&PartitionId::new(topic, partition))
            .map_or(0, |log| log.committed)
    }

    /// Every acknowledgement, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<(PartitionId, i64)> {
        self.state().acknowledged.clone()
    }

    /// Every release, in order.
    #[must_use]
    pub fn released(&self) -> Vec<(PartitionId, i64)> {
        self.state().released.clone()
    }

    /// Whether every appended message of `topic` has been committed.
    #[must_use]
    pub fn is_drained(&self, topic: &str) -> bool {
        self.state()
            .logs
            .iter()
            .filter(|(id, _)| id.topic == topic)
            .all(|(_, log)| usize::try_from(log.committed).is_ok_and(|c| c >= log.entries.len()))
    }

    /// Make retry scheduling fail (simulates a retry lane outage).
    pub fn set_schedule_failure(&self, fail: bool) {
        self.fail_schedules.store(fail, Ordering::SeqCst);
    }

    /// End all subscription streams once they have nothing left to deliver.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, Result<MessageStream, TransportError>> {
        let topics = topics.to_vec();
        let state = Arc::clone(&self.state);
        let notify = Arc::clone(&self.notify);

        Box::pin(async move {
            let stream = stream! {
                loop {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let (next, closed) = {
                        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                        (state.next_message(&topics), state.closed)
                    };

                    match next {
                        Some(message) => yield Ok(message),
                        None if closed => break,
                        None => notified.await,
                    }
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn acknowledge<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state();
            let id = message.partition_id();
            let log = state.logs.get_mut(&id).ok_or_else(|| TransportError::CommitFailed {
                partition: id.clone(),
                offset: message.offset,
                reason: "unknown partition".to_string(),
            })?;
            log.committed = log.committed.max(message.offset + 1);
            state.acknowledged.push((id, message.offset));
            Ok(())
        })
    }

    fn release<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.state();
                let id = message.partition_id();
                let log = state.logs.get_mut(&id).ok_or_else(|| TransportError::SeekFailed {
                    partition: id.clone(),
                    offset: message.offset,
                    reason: "unknown partition".to_string(),
                })?;
                let offset = usize::try_from(message.offset).unwrap_or(0);
                log.cursor = log.cursor.min(offset);
                state.released.push((id, message.offset));
            }
            self.notify.notify_waiters();
            Ok(())
        })
    }
}

impl RetryScheduler for InMemoryBus {
    fn schedule<'a>(
        &'a self,
        message: &'a InboundMessage,
        attempt: &'a DeliveryAttempt,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let source = message.source_topic().to_string();
            let retry_topic = topics::retry_topic(&source);
            if self.fail_schedules.load(Ordering::SeqCst) {
                return Err(TransportError::PublishFailed {
                    topic: retry_topic,
                    reason: "retry lane unavailable".to_string(),
                });
            }

            let mut headers = message.headers.clone();
            attempt.write_headers(&mut headers);
            headers.insert(ORIGINAL_TOPIC_HEADER.to_string(), source);
            self.publish_with_headers(&retry_topic, message.key.clone(), message.payload.clone(), headers);
            Ok(())
        })
    }
}
