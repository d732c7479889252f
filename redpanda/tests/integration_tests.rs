//! Integration tests for the Kafka transport with a real broker.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Subscribe, acknowledge and committed positions
//! - Release (seek) redelivery
//! - Retry lane headers and keys
//! - Dead-letter topic records
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p notification-relay-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use notification_relay_core::attempt::{ATTEMPT_HEADER, DeliveryAttempt, NOT_BEFORE_HEADER, ORIGINAL_TOPIC_HEADER};
use notification_relay_core::dead_letter::{DeadLetterRecord, DeadLetterSink};
use notification_relay_core::error::{ErrorKind, ProcessingFailure};
use notification_relay_core::transport::{InboundMessage, MessageBus, MessageStream, RetryScheduler};
use notification_relay_redpanda::KafkaMessageBus;
use notification_relay_testing::helpers;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Helper to wait for Kafka to accept writes
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = KafkaMessageBus::builder().brokers(brokers).build() {
            if bus.publisher().publish("warmup-topic", None, b"warmup", &[]).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn bus(brokers: &str, group: &str) -> KafkaMessageBus {
    KafkaMessageBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create bus")
}

async fn next_message(stream: &mut MessageStream) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("Failed to receive message")
}

#[tokio::test]
#[ignore]
async fn test_acknowledged_messages_are_not_redelivered_to_group() {
    let (_kafka, brokers) = start_kafka().await;
    let topic = "reservation-created".to_string();
    let raw = helpers::reservation_envelope("m1", "ReservationCreated", "r1", "a@b.com");

    let first = bus(&brokers, "ack-group");
    first
        .publisher()
        .publish(&topic, Some(b"r1"), &raw, &[])
        .await
        .expect("Failed to publish");

    let mut stream = first.subscribe(std::slice::from_ref(&topic)).await.expect("Failed to subscribe");
    let message = next_message(&mut stream).await;
    assert_eq!(message.payload, raw);
    assert_eq!(message.key.as_deref(), Some(&b"r1"[..]));
    first.acknowledge(&message).await.expect("Failed to acknowledge");

    // Give the async commit time to land, then leave the group.
    tokio::time::sleep(Duration::from_secs(2)).await;
    drop(stream);
    drop(first);

    let second = bus(&brokers, "ack-group");
    second
        .publisher()
        .publish(&topic, Some(b"r2"), b"second", &[])
        .await
        .expect("Failed to publish");
    let mut stream = second.subscribe(std::slice::from_ref(&topic)).await.expect("Failed to subscribe");

    let message = next_message(&mut stream).await;
    assert_eq!(message.payload, b"second");
}

#[tokio::test]
#[ignore]
async fn test_release_redelivers_from_released_offset() {
    let (_kafka, brokers) = start_kafka().await;
    let topic = "reservation-cancelled".to_string();
    let bus = bus(&brokers, "release-group");

    for payload in [&b"a"[..], &b"b"[..]] {
        bus.publisher()
            .publish(&topic, Some(b"r1"), payload, &[])
            .await
            .expect("Failed to publish");
    }

    let mut stream = bus.subscribe(std::slice::from_ref(&topic)).await.expect("Failed to subscribe");
    let first = next_message(&mut stream).await;
    assert_eq!(first.payload, b"a");

    bus.release(&first).await.expect("Failed to release");

    // Anything already buffered past the released offset may arrive first.
    let redelivered = loop {
        let message = next_message(&mut stream).await;
        if message.offset == first.offset {
            break message;
        }
    };
    assert_eq!(redelivered.payload, b"a");
}

#[tokio::test]
#[ignore]
async fn test_retry_scheduler_publishes_to_retry_lane() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "retry-group");
    let source = InboundMessage::new("reservation-confirmed", 0, 7, b"raw bytes".to_vec()).with_key(Some(b"r1".to_vec()));
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
    let next = DeliveryAttempt::first(now).next("smtp unavailable", now + chrono::Duration::seconds(1));

    bus.retry_scheduler().schedule(&source, &next).await.expect("Failed to schedule");

    let mut stream = bus
        .subscribe(&["reservation-confirmed-retry".to_string()])
        .await
        .expect("Failed to subscribe");
    let retried = next_message(&mut stream).await;

    assert_eq!(retried.payload, b"raw bytes");
    assert_eq!(retried.key.as_deref(), Some(&b"r1"[..]));
    assert_eq!(retried.headers.get(ATTEMPT_HEADER).map(String::as_str), Some("2"));
    assert!(retried.headers.contains_key(NOT_BEFORE_HEADER));
    assert_eq!(
        retried.headers.get(ORIGINAL_TOPIC_HEADER).map(String::as_str),
        Some("reservation-confirmed")
    );
    assert_eq!(retried.attempt(now).attempt_number, 2);
}

#[tokio::test]
#[ignore]
async fn test_dead_letter_sink_publishes_raw_bytes_with_metadata() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "dlt-group");
    let record = DeadLetterRecord::new(
        b"{not json".to_vec(),
        "reservation-created",
        &ProcessingFailure::new(ErrorKind::Decode, "expected value"),
        1,
        Utc::now(),
    );

    bus.dead_letter_sink().write(&record).await.expect("Failed to write");
    // Duplicate writes are tolerated.
    bus.dead_letter_sink().write(&record).await.expect("Failed to write twice");

    let mut stream = bus
        .subscribe(&["reservation-created-dlt".to_string()])
        .await
        .expect("Failed to subscribe");
    let first = next_message(&mut stream).await;
    let second = next_message(&mut stream).await;

    assert_eq!(first.payload, b"{not json");
    assert_eq!(first.headers.get("finalErrorKind").map(String::as_str), Some("DecodeError"));
    assert_eq!(first.headers.get("attemptsMade").map(String::as_str), Some("1"));
    assert_eq!(first.headers.get("sourceTopic").map(String::as_str), Some("reservation-created"));
    assert_eq!(second.payload, first.payload);
}
