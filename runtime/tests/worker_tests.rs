//! Partition workers and the consumer runtime over the in-memory bus.
//!
//! Time is paused: backoff waits and release delays advance virtually.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use notification_relay_core::dispatcher::{DispatchError, Dispatcher};
use notification_relay_core::envelope::Envelope;
use notification_relay_core::event::DomainEvent;
use notification_relay_core::BoxFuture;
use notification_relay_core::transport::{InboundMessage, MessageBus, MessageStream, TransportError};
use notification_relay_runtime::consumer::MessageProcessor;
use notification_relay_runtime::error::RuntimeError;
use notification_relay_runtime::retry::RetryPolicy;
use notification_relay_runtime::worker::{ConsumerRuntime, ConsumerSettings, Shutdown};
use notification_relay_testing::{InMemoryBus, InMemoryDeadLetterSink, ScriptedDispatcher, helpers, test_clock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const TOPIC: &str = "reservation-created";
const RETRY_TOPIC: &str = "reservation-created-retry";

/// Fails the first `n` dispatches of selected message ids and records when
/// every call happened.
#[derive(Default, Clone)]
struct FlakyDispatcher {
    failures: Arc<Mutex<HashMap<String, usize>>>,
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
    latency: Duration,
    // Latency applies only to ids with this prefix when set
    slow_prefix: Option<String>,
}

impl FlakyDispatcher {
    fn failing(message_id: &str, times: usize) -> Self {
        let dispatcher = Self::default();
        dispatcher
            .failures
            .lock()
            .unwrap()
            .insert(message_id.to_string(), times);
        dispatcher
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn slow_for(prefix: &str, latency: Duration) -> Self {
        Self {
            latency,
            slow_prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, message_id: &str) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, at)| at)
            .collect()
    }
}

impl Dispatcher for FlakyDispatcher {
    fn dispatch<'a>(&'a self, envelope: &'a Envelope<DomainEvent>) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((envelope.message_id.clone(), Instant::now()));
            let slow = self
                .slow_prefix
                .as_deref()
                .is_none_or(|prefix| envelope.message_id.starts_with(prefix));
            if slow && !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&envelope.message_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(DispatchError::Transient("smtp unavailable".into()))
                },
                _ => Ok(()),
            }
        })
    }
}

fn runtime(
    bus: &InMemoryBus,
    sink: &InMemoryDeadLetterSink,
    dispatcher: Arc<dyn Dispatcher>,
    settings: ConsumerSettings,
) -> Arc<ConsumerRuntime> {
    let processor = MessageProcessor::new(
        dispatcher,
        Arc::new(sink.clone()),
        Arc::new(bus.clone()),
        RetryPolicy::from_config(&settings),
        Arc::new(test_clock()),
    );
    Arc::new(ConsumerRuntime::new(Arc::new(bus.clone()), processor, settings))
}

/// Delegates to an [`InMemoryBus`] but can never seek.
struct SeekFailingBus(InMemoryBus);

impl MessageBus for SeekFailingBus {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> BoxFuture<'a, Result<MessageStream, TransportError>> {
        self.0.subscribe(topics)
    }

    fn acknowledge<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        self.0.acknowledge(message)
    }

    fn release<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            Err(TransportError::SeekFailed {
                partition: message.partition_id(),
                offset: message.offset,
                reason: "broker rejected seek".to_string(),
            })
        })
    }
}

fn settings() -> ConsumerSettings {
    ConsumerSettings::builder()
        .topic(TOPIC)
        .release_delay(Duration::from_millis(100))
        .build()
}

fn created(message_id: &str, reservation_id: &str) -> Vec<u8> {
    helpers::reservation_envelope(message_id, "ReservationCreated", reservation_id, "a@b.com")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_waits_in_retry_lane_without_blocking_source_partition() {
    helpers::init_tracing();
    let bus = InMemoryBus::new(2);
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = FlakyDispatcher::failing("m1", 2);
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings());

    bus.publish(TOPIC, Some("r1"), created("m1", "r1"));
    bus.publish(TOPIC, Some("r1"), created("m2", "r1"));
    bus.publish(TOPIC, Some("r2"), created("m3", "r2"));

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| dispatcher.calls_for("m1").len() == 3 && bus.is_drained(RETRY_TOPIC)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let m1 = dispatcher.calls_for("m1");
    assert!(m1[1] - m1[0] >= Duration::from_millis(1000));
    assert!(m1[2] - m1[1] >= Duration::from_millis(2000));

    // The message behind m1 did not wait for m1's backoff.
    let m2 = dispatcher.calls_for("m2");
    assert_eq!(m2.len(), 1);
    assert!(m2[0] < m1[1]);
    assert_eq!(dispatcher.calls_for("m3").len(), 1);

    assert!(bus.is_drained(TOPIC));
    assert_eq!(bus.messages(RETRY_TOPIC).len(), 2);
    assert!(sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_dead_lettered_and_committed() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = FlakyDispatcher::failing("m1", 3);
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings());

    bus.publish(TOPIC, Some("r1"), created("m1", "r1"));

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| sink.len() == 1).await;
    wait_until(|| bus.is_drained(RETRY_TOPIC)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let record = &sink.records()[0];
    assert_eq!(record.attempts_made, 3);
    assert_eq!(record.source_topic, TOPIC);
    assert!(bus.is_drained(TOPIC));
}

#[tokio::test(start_paused = true)]
async fn sink_outage_rewinds_partition_until_sink_recovers() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = ScriptedDispatcher::new();
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings());
    sink.set_unavailable(true);

    bus.publish(TOPIC, Some("r1"), b"{not json".to_vec());
    bus.publish(TOPIC, Some("r1"), created("m2", "r1"));

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| sink.write_attempts() >= 3).await;
    // Nothing behind the stuck message is processed or committed.
    assert_eq!(dispatcher.call_count(), 0);
    assert_eq!(bus.committed(TOPIC, 0), 0);
    assert!(!bus.released().is_empty());

    sink.set_unavailable(false);
    wait_until(|| bus.is_drained(TOPIC)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink.records()[0].raw, b"{not json");
    assert!(dispatcher.call_count() >= 1);
    assert!(dispatcher.calls().iter().all(|e| e.message_id == "m2"));
}

#[tokio::test(start_paused = true)]
async fn failed_seek_reprocesses_in_place_without_skipping_later_offsets() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = ScriptedDispatcher::new();
    let settings = settings();
    let processor = MessageProcessor::new(
        Arc::new(dispatcher.clone()),
        Arc::new(sink.clone()),
        Arc::new(bus.clone()),
        RetryPolicy::from_config(&settings),
        Arc::new(test_clock()),
    );
    let consumer = Arc::new(ConsumerRuntime::new(
        Arc::new(SeekFailingBus(bus.clone())),
        processor,
        settings,
    ));
    sink.set_unavailable(true);

    bus.publish(TOPIC, Some("r1"), b"{not json".to_vec());
    for n in 1..=5 {
        bus.publish(TOPIC, Some("r1"), created(&format!("m{n}"), "r1"));
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| sink.write_attempts() >= 3).await;
    assert_eq!(dispatcher.call_count(), 0);
    assert_eq!(bus.committed(TOPIC, 0), 0);

    sink.set_unavailable(false);
    wait_until(|| bus.is_drained(TOPIC)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    assert_eq!(sink.len(), 1);
    assert_eq!(sink.records()[0].raw, b"{not json");
    let ids: Vec<_> = dispatcher.calls().into_iter().map(|e| e.message_id).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "m5"]);
    assert!(bus.released().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_partition_does_not_hold_up_other_partitions() {
    let bus = InMemoryBus::new(2);
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = FlakyDispatcher::slow_for("slow", Duration::from_secs(10));
    let settings = ConsumerSettings::builder()
        .topic(TOPIC)
        .partition_buffer(1)
        .build();
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings);

    let slow_partition = bus.partition_for(Some("r-slow".as_bytes()));
    let fast_key = (0..)
        .map(|n| format!("r{n}"))
        .find(|key| bus.partition_for(Some(key.as_bytes())) != slow_partition)
        .unwrap();

    for n in 0..6 {
        bus.publish(TOPIC, Some("r-slow"), created(&format!("slow{n}"), "r-slow"));
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let published_at = Instant::now();
    bus.publish(TOPIC, Some(&fast_key), created("fast", &fast_key));

    wait_until(|| !dispatcher.calls_for("fast").is_empty()).await;
    assert!(dispatcher.calls_for("fast")[0] - published_at < Duration::from_secs(1));
    assert!(dispatcher.calls().len() < 7, "slow partition should still be busy");

    wait_until(|| bus.is_drained(TOPIC)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let slow: Vec<_> = dispatcher
        .calls()
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| id.starts_with("slow"))
        .collect();
    let expected: Vec<_> = (0..6).map(|n| format!("slow{n}")).collect();
    assert_eq!(slow, expected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_finishes_in_flight_and_leaves_rest_unacknowledged() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = FlakyDispatcher::slow(Duration::from_secs(5));
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings());

    for n in 0..3 {
        bus.publish(TOPIC, Some("r1"), created(&format!("m{n}"), "r1"));
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| !dispatcher.calls().is_empty()).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    assert_eq!(dispatcher.calls().len(), 1);
    assert_eq!(bus.committed(TOPIC, 0), 1);
    assert!(!bus.is_drained(TOPIC));
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_on_stuck_dispatch() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = FlakyDispatcher::slow(Duration::from_secs(600));
    let settings = ConsumerSettings::builder()
        .topic(TOPIC)
        .shutdown_timeout(Duration::from_secs(1))
        .build();
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings);

    bus.publish(TOPIC, Some("r1"), created("m1", "r1"));

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    let handle = tokio::spawn(async move { consumer.run(signal).await });

    wait_until(|| !dispatcher.calls().is_empty()).await;
    shutdown.trigger();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(RuntimeError::ShutdownTimeout(1))));
    assert_eq!(bus.committed(TOPIC, 0), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_end_drains_buffered_messages() {
    let bus = InMemoryBus::new(3);
    let sink = InMemoryDeadLetterSink::new();
    let dispatcher = ScriptedDispatcher::new();
    let consumer = runtime(&bus, &sink, Arc::new(dispatcher.clone()), settings());

    for n in 0..10 {
        bus.publish(TOPIC, Some(&format!("r{n}")), created(&format!("m{n}"), &format!("r{n}")));
    }
    bus.close();

    consumer.run(Shutdown::new().signal()).await.unwrap();

    assert_eq!(dispatcher.call_count(), 10);
    assert!(bus.is_drained(TOPIC));
}

#[tokio::test]
async fn run_without_topics_fails() {
    let bus = InMemoryBus::default();
    let sink = InMemoryDeadLetterSink::new();
    let consumer = runtime(&bus, &sink, Arc::new(ScriptedDispatcher::new()), ConsumerSettings::default());

    let result = consumer.run(Shutdown::new().signal()).await;

    assert!(matches!(result, Err(RuntimeError::NoTopics)));
}

#[test]
fn subscription_includes_retry_lanes_once() {
    let settings = ConsumerSettings::builder()
        .topics(["reservation-created", "reservation-created-retry", "reservation-cancelled"])
        .build();

    assert_eq!(
        settings.subscription_topics(),
        vec![
            "reservation-created",
            "reservation-created-retry",
            "reservation-cancelled",
            "reservation-cancelled-retry",
        ]
    );
}
