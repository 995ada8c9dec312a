//! Integration tests for [`RedpandaMessageBus`] against a real Kafka instance.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker and take 15-60 seconds each to spin up Kafka:
//!
//! ```bash
//! cargo test -p marksign-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]

use chrono::Utc;
use futures::StreamExt;
use marksign_core::bus::{MessageBus, MessageStream};
use marksign_core::ids::{OrderId, ProductItemId};
use marksign_core::message::{Envelope, SerializedMessage, SignMessage};
use marksign_redpanda::RedpandaMessageBus;
use std::time::{Duration, Instant};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn fulfilled() -> Envelope {
    Envelope::new(
        SignMessage::OrderFulfilled {
            order: OrderId::new(),
            product_item: ProductItemId::new(),
        },
        Utc::now(),
    )
}

fn warmup() -> SerializedMessage {
    SerializedMessage::new("warmup".to_string(), vec![255])
}

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
    (kafka, format!("{host}:{port}"))
}

/// Publish a warmup message until the broker accepts it, creating `topic`.
async fn ensure_topic_exists(bus: &RedpandaMessageBus, topic: &str) {
    for attempt in 1..=60 {
        if bus.dispatch(topic, &warmup(), None).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

async fn next_envelope(stream: &mut MessageStream) -> Envelope {
    loop {
        let message = stream
            .next()
            .await
            .expect("stream ended")
            .expect("Failed to receive message");
        if message.message_type != "warmup" {
            return Envelope::decode(&message).expect("Failed to decode envelope");
        }
    }
}

#[tokio::test]
#[ignore]
async fn test_dispatch_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create bus");
    ensure_topic_exists(&bus, "sign-commands").await;

    let mut stream = bus
        .subscribe(&["sign-commands"])
        .await
        .expect("Failed to subscribe");

    let first = fulfilled();
    let second = fulfilled().next_attempt();
    for envelope in [&first, &second] {
        bus.dispatch("sign-commands", &envelope.encode().expect("encode"), None)
            .await
            .expect("Failed to dispatch");
    }

    let received = tokio::time::timeout(Duration::from_secs(15), async {
        vec![next_envelope(&mut stream).await, next_envelope(&mut stream).await]
    })
    .await
    .expect("Timeout waiting for messages");

    assert_eq!(received, vec![first, second]);
}

#[tokio::test]
#[ignore]
async fn test_delayed_dispatch_arrives_later() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("delayed")
        .build()
        .expect("Failed to create bus");
    ensure_topic_exists(&bus, "sign-retries").await;

    let mut stream = bus
        .subscribe(&["sign-retries"])
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let envelope = fulfilled();
    let started = Instant::now();
    bus.dispatch(
        "sign-retries",
        &envelope.encode().expect("encode"),
        Some(Duration::from_secs(2)),
    )
    .await
    .expect("Failed to schedule");

    let received = tokio::time::timeout(Duration::from_secs(20), next_envelope(&mut stream))
        .await
        .expect("Timeout waiting for delayed message");

    assert_eq!(received, envelope);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
#[ignore]
async fn test_new_group_reads_earlier_messages() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .consumer_group("late-joiner")
        .build()
        .expect("Failed to create bus");

    let envelope = fulfilled();
    ensure_topic_exists(&bus, "sign-backlog").await;
    bus.dispatch("sign-backlog", &envelope.encode().expect("encode"), None)
        .await
        .expect("Failed to dispatch");

    let mut stream = bus
        .subscribe(&["sign-backlog"])
        .await
        .expect("Failed to subscribe");

    let received = tokio::time::timeout(Duration::from_secs(15), next_envelope(&mut stream))
        .await
        .expect("Timeout waiting for backlog");
    assert_eq!(received, envelope);
}
