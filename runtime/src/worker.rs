//! Partition workers and the consumer runtime.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────┐
//!  MessageBus ───────▶│    router    │ one merged stream
//!                     └──────┬───────┘
//!            ┌───────────────┼────────────────┐
//!            ▼               ▼                ▼
//!   ┌────────────────┐ ┌────────────────┐ ┌──────────────────────┐
//!   │ created[0]     │ │ created[1]     │ │ created-retry[0]     │
//!   │ PartitionWorker│ │ PartitionWorker│ │ PartitionWorker      │
//!   └────────────────┘ └────────────────┘ │ (waits x-not-before) │
//!                                         └──────────────────────┘
//! ```
//!
//! Each `(topic, partition)` gets its own worker task, spawned on first
//! sight. A worker processes its messages strictly in order; workers run in
//! parallel. Backoff waits happen only in retry-lane workers, so a failing
//! message never holds up the source partition.

use crate::consumer::{MessageProcessor, ProcessingReport};
use crate::error::RuntimeError;
use crate::metrics::ConsumerMetrics;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use notification_relay_core::BoxFuture;
use notification_relay_core::topics;
use notification_relay_core::transport::{InboundMessage, MessageBus, PartitionId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Consumer configuration.
///
/// `max_attempts`, `base_delay_ms`, `backoff_multiplier`,
/// `topics_subscribed` and `consumer_group` are the recognised consumer
/// options; the rest are runtime knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Maximum attempts per message, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Source topics to consume (retry lanes are added automatically)
    pub topics_subscribed: Vec<String>,
    /// Consumer group id
    pub consumer_group: String,
    /// Messages buffered per partition worker
    pub partition_buffer: usize,
    /// Pause before rewinding a partition whose message could not be settled
    pub release_delay: Duration,
    /// How long workers may take to finish in-flight messages on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1000,
            backoff_multiplier: crate::retry::DEFAULT_MULTIPLIER,
            topics_subscribed: Vec::new(),
            consumer_group: "notification-group".to_string(),
            partition_buffer: 64,
            release_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerSettings {
    /// Create a settings builder starting from the defaults.
    #[must_use]
    pub fn builder() -> ConsumerSettingsBuilder {
        ConsumerSettingsBuilder {
            settings: Self::default(),
        }
    }

    /// Every topic the consumer reads: each source topic and its retry lane.
    #[must_use]
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::with_capacity(self.topics_subscribed.len() * 2);
        for topic in &self.topics_subscribed {
            let source = topics::source_topic(topic);
            for candidate in [source.to_string(), topics::retry_topic(source)] {
                if !topics.contains(&candidate) {
                    topics.push(candidate);
                }
            }
        }
        topics
    }
}

/// Builder for [`ConsumerSettings`].
#[derive(Debug, Clone)]
pub struct ConsumerSettingsBuilder {
    settings: ConsumerSettings,
}

impl ConsumerSettingsBuilder {
    /// Set the maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.settings.max_attempts = max_attempts;
        self
    }

    /// Set the base delay in milliseconds.
    #[must_use]
    pub const fn base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.settings.base_delay_ms = base_delay_ms;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.settings.backoff_multiplier = multiplier;
        self
    }

    /// Add a source topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.settings.topics_subscribed.push(topic.into());
        self
    }

    /// Replace the source topics.
    #[must_use]
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.topics_subscribed = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.settings.consumer_group = group.into();
        self
    }

    /// Set the per-partition buffer size (at least 1).
    #[must_use]
    pub const fn partition_buffer(mut self, size: usize) -> Self {
        self.settings.partition_buffer = size;
        self
    }

    /// Set the pause before a partition rewind.
    #[must_use]
    pub const fn release_delay(mut self, delay: Duration) -> Self {
        self.settings.release_delay = delay;
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    /// Build the settings.
    #[must_use]
    pub fn build(mut self) -> ConsumerSettings {
        self.settings.partition_buffer = self.settings.partition_buffer.max(1);
        self.settings
    }
}

/// Triggers graceful shutdown of a [`ConsumerRuntime`].
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create an untriggered shutdown handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal that observes this handle.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Begin shutdown: intake stops and workers stop after their in-flight
    /// message.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is triggered.
    ///
    /// Never resolves if the [`Shutdown`] handle is dropped untriggered.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How releasing an unsettled message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// The partition was sought back; the offset will be redelivered.
    Rewound,
    /// Shutdown began during the release delay.
    Interrupted,
    /// The seek failed.
    Failed,
}

/// Sequential processor for one `(topic, partition)`.
pub struct PartitionWorker {
    partition: PartitionId,
    processor: MessageProcessor,
    bus: Arc<dyn MessageBus>,
    release_delay: Duration,
    rewind_to: Option<i64>,
}

impl PartitionWorker {
    /// Create a worker for `partition`.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        processor: MessageProcessor,
        bus: Arc<dyn MessageBus>,
        release_delay: Duration,
    ) -> Self {
        Self {
            partition,
            processor,
            bus,
            release_delay,
            rewind_to: None,
        }
    }

    /// The partition this worker owns.
    #[must_use]
    pub const fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Handle one message from this worker's partition.
    ///
    /// Returns `None` when the message was not processed: it is a stale
    /// delivery behind a pending rewind, or shutdown began while it waited
    /// for its not-before instant. Such messages are left unacknowledged.
    ///
    /// A message that cannot be settled is released for redelivery. If the
    /// seek fails it is reprocessed here after `release_delay` until it
    /// settles or shutdown begins.
    pub async fn handle(
        &mut self,
        message: InboundMessage,
        shutdown: &mut ShutdownSignal,
    ) -> Option<ProcessingReport> {
        if let Some(rewind_to) = self.rewind_to {
            if message.offset > rewind_to {
                tracing::debug!(
                    partition = %self.partition,
                    offset = message.offset,
                    rewind_to,
                    "Skipping message until released offset is redelivered"
                );
                ConsumerMetrics::record_skipped(&message.topic);
                return None;
            }
            self.rewind_to = None;
        }

        let attempt = message.attempt(self.processor.clock().now());
        if let Some(delay) = attempt.remaining_delay(self.processor.clock().now()) {
            tracing::debug!(
                partition = %self.partition,
                offset = message.offset,
                attempt = attempt.attempt_number,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting for redelivery to become due"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = shutdown.triggered() => return None,
            }
        }

        loop {
            let report = self.processor.process(&message).await;

            if report.outcome.should_acknowledge() {
                match self.bus.acknowledge(&message).await {
                    Ok(()) => ConsumerMetrics::record_acknowledged(&message.topic),
                    Err(e) => {
                        // The next commit of this partition covers this offset too.
                        tracing::warn!(
                            partition = %self.partition,
                            offset = message.offset,
                            error = %e,
                            "Failed to acknowledge message"
                        );
                        ConsumerMetrics::record_settlement_error(&message.topic);
                    },
                }
                return Some(report);
            }

            ConsumerMetrics::record_unacknowledged(&message.topic);
            match self.release(&message, shutdown).await {
                Release::Rewound | Release::Interrupted => return Some(report),
                Release::Failed if shutdown.is_triggered() => return Some(report),
                // No seek happened, so nothing will redeliver this offset.
                Release::Failed => {
                    tracing::warn!(
                        partition = %self.partition,
                        offset = message.offset,
                        "Reprocessing unsettled message in place"
                    );
                },
            }
        }
    }

    /// Wait `release_delay`, then seek the partition back to `message`.
    ///
    /// Later offsets are skipped only once the seek succeeded.
    async fn release(&mut self, message: &InboundMessage, shutdown: &mut ShutdownSignal) -> Release {
        if !self.release_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.release_delay) => {},
                () = shutdown.triggered() => return Release::Interrupted,
            }
        }

        match self.bus.release(message).await {
            Ok(()) => {
                // Later offsets already buffered must not be processed ahead of it.
                self.rewind_to = Some(message.offset);
                tracing::info!(
                    partition = %self.partition,
                    offset = message.offset,
                    "Partition rewound for redelivery"
                );
                ConsumerMetrics::record_released(&message.topic);
                Release::Rewound
            },
            Err(e) => {
                tracing::error!(
                    partition = %self.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to rewind partition"
                );
                ConsumerMetrics::record_settlement_error(&message.topic);
                Release::Failed
            },
        }
    }

    /// Process messages from `rx` until it closes or shutdown is triggered.
    pub async fn run(mut self, mut rx: mpsc::Receiver<InboundMessage>, mut shutdown: ShutdownSignal) {
        ConsumerMetrics::record_worker_started();
        tracing::debug!(partition = %self.partition, "Partition worker started");

        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                next = rx.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message, &mut shutdown).await;
        }

        tracing::debug!(partition = %self.partition, "Partition worker stopped");
        ConsumerMetrics::record_worker_stopped();
    }
}

/// Router-side state of one partition worker.
///
/// Messages that do not fit the worker's channel wait in `pending`, so a
/// slow partition never blocks intake for the others.
struct PartitionSlot {
    tx: mpsc::Sender<InboundMessage>,
    pending: VecDeque<InboundMessage>,
}

impl PartitionSlot {
    const fn new(tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            tx,
            pending: VecDeque::new(),
        }
    }

    /// Hand every held message to the worker, in order.
    async fn flush(self) {
        for message in self.pending {
            if self.tx.send(message).await.is_err() {
                break;
            }
        }
    }
}

type Reservation = (PartitionId, Result<OwnedPermit<InboundMessage>, SendError<()>>);

/// Wait for room in a partition's channel.
fn reserve(partition: PartitionId, tx: mpsc::Sender<InboundMessage>) -> BoxFuture<'static, Reservation> {
    Box::pin(async move { (partition, tx.reserve_owned().await) })
}

/// Consumes the configured topics with one worker per partition.
pub struct ConsumerRuntime {
    bus: Arc<dyn MessageBus>,
    processor: MessageProcessor,
    settings: ConsumerSettings,
}

impl ConsumerRuntime {
    /// Create a runtime.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, processor: MessageProcessor, settings: ConsumerSettings) -> Self {
        Self {
            bus,
            processor,
            settings,
        }
    }

    /// The settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Consume until the stream ends or `shutdown` is triggered.
    ///
    /// On shutdown, intake stops first; each worker then finishes its
    /// in-flight message within `shutdown_timeout`. Buffered messages are
    /// left unacknowledged for redelivery after restart. When the stream
    /// ends instead, every received message is handed to its worker first.
    ///
    /// The router never waits on one partition's channel: messages for a
    /// full partition are held until its worker has room.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::NoTopics`]: nothing to subscribe to
    /// - [`RuntimeError::Subscription`]: the bus refused the subscription
    /// - [`RuntimeError::ShutdownTimeout`]: workers did not stop in time
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), RuntimeError> {
        let topics = self.settings.subscription_topics();
        if topics.is_empty() {
            return Err(RuntimeError::NoTopics);
        }

        let mut stream = self.bus.subscribe(&topics).await?;
        tracing::info!(
            topics = ?topics,
            consumer_group = %self.settings.consumer_group,
            "Consumer started"
        );

        let mut slots: HashMap<PartitionId, PartitionSlot> = HashMap::new();
        let mut reserving: FuturesUnordered<BoxFuture<'static, Reservation>> = FuturesUnordered::new();
        let mut tasks = JoinSet::new();
        let mut stream_ended = false;

        'intake: loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => break 'intake,
                Some((partition, reserved)) = reserving.next(), if !reserving.is_empty() => {
                    let Ok(permit) = reserved else {
                        tracing::error!(partition = %partition, "Partition worker is gone");
                        slots.remove(&partition);
                        continue;
                    };
                    if let Some(slot) = slots.get_mut(&partition) {
                        if let Some(message) = slot.pending.pop_front() {
                            permit.send(message);
                        }
                        if !slot.pending.is_empty() {
                            reserving.push(reserve(partition, slot.tx.clone()));
                        }
                    }
                },
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let partition = message.partition_id();
                        let slot = slots.entry(partition.clone()).or_insert_with(|| {
                            let (tx, rx) = mpsc::channel(self.settings.partition_buffer);
                            let worker = PartitionWorker::new(
                                partition.clone(),
                                self.processor.clone(),
                                Arc::clone(&self.bus),
                                self.settings.release_delay,
                            );
                            tasks.spawn(worker.run(rx, shutdown.clone()));
                            PartitionSlot::new(tx)
                        });

                        // A full partition holds its own messages and nobody else's.
                        if !slot.pending.is_empty() {
                            slot.pending.push_back(message);
                            continue;
                        }
                        match slot.tx.try_send(message) {
                            Ok(()) => {},
                            Err(TrySendError::Full(message)) => {
                                tracing::debug!(partition = %partition, "Partition buffer full, holding messages");
                                slot.pending.push_back(message);
                                reserving.push(reserve(partition, slot.tx.clone()));
                            },
                            Err(TrySendError::Closed(_)) => {
                                tracing::error!(partition = %partition, "Partition worker is gone");
                                slots.remove(&partition);
                            },
                        }
                    },
                    Some(Err(e)) => tracing::warn!(error = %e, "Error receiving message"),
                    None => {
                        tracing::info!("Message stream ended");
                        stream_ended = true;
                        break 'intake;
                    },
                },
            }
        }

        // Stop intake before waiting on workers.
        drop(stream);
        drop(reserving);
        if stream_ended {
            let flushed = futures::future::join_all(slots.into_values().map(PartitionSlot::flush));
            tokio::select! {
                biased;
                () = shutdown.triggered() => {},
                _ = flushed => {},
            }
        } else {
            drop(slots);
        }

        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Partition worker failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            let remaining = tasks.len();
            tasks.abort_all();
            tracing::warn!(remaining, "Shutdown timed out, in-flight messages left unacknowledged");
            return Err(RuntimeError::ShutdownTimeout(remaining));
        }

        tracing::info!("Consumer stopped");
        Ok(())
    }
}
