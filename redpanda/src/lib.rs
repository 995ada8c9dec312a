//! Redpanda message bus for marksign.
//!
//! Implements [`MessageBus`] over rdkafka, so any Kafka-compatible broker
//! (Redpanda, Apache Kafka, MSK) can carry lifecycle messages.
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - An offset is committed only after the message was handed to the
//!   subscriber's channel
//! - A crash before the commit redelivers the message; handlers are idempotent
//! - Messages are keyed by type, so one type keeps its order within a partition
//!
//! # Delayed Dispatch
//!
//! Kafka has no native delivery delay. A dispatch with a delay spawns a task
//! that sleeps and then produces. A scheduled message that has not been
//! produced yet is lost if the process stops; the handler's dedup guard was
//! already released, so the upstream redelivery path still applies.
//!
//! # Example
//!
//! ```no_run
//! use marksign_core::bus::MessageBus;
//! use marksign_redpanda::RedpandaMessageBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("marksign-worker")
//!     .build()?;
//!
//! let mut stream = bus.subscribe(&["sign-commands"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(message) => println!("Received: {}", message.message_type),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use marksign_core::bus::{BusError, MessageBus, MessageStream};
use marksign_core::message::SerializedMessage;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default channel capacity between the consumer task and the subscriber.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "marksign";

/// Kafka-compatible [`MessageBus`].
///
/// Cheap to share behind an `Arc`; the producer is internally pooled.
pub struct RedpandaMessageBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaMessageBus {
    /// Bus with default settings.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by [`MessageBus::subscribe`].
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    async fn produce(
        producer: &FutureProducer,
        topic: &str,
        message: &SerializedMessage,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let payload = bincode::serialize(message).map_err(|e| BusError::DispatchFailed {
            topic: topic.to_string(),
            reason: format!("Failed to serialize message: {e}"),
        })?;

        let record = FutureRecord::to(topic)
            .payload(&payload)
            .key(message.message_type.as_bytes());

        match producer.send(record, Timeout::After(timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic,
                    partition,
                    offset,
                    message_type = %message.message_type,
                    "Message dispatched"
                );
                Ok(())
            },
            Err((kafka_error, _)) => {
                tracing::error!(topic, error = %kafka_error, "Failed to dispatch message");
                Err(BusError::DispatchFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            },
        }
    }
}

/// Builder for [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaMessageBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`. Default `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec. Default `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every worker instance.
    ///
    /// Instances in one group split the partitions between them.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Messages buffered between the consumer and the subscriber. Zero is
    /// treated as one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new group starts reading: `"earliest"`, `"latest"` or `"error"`.
    /// Default `"earliest"`, so commands issued before the first worker
    /// started are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] if brokers are not set or the producer
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            consumer_group = %consumer_group,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaMessageBus created"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

fn decode(message: &BorrowedMessage<'_>) -> Result<SerializedMessage, BusError> {
    let payload = message
        .payload()
        .ok_or_else(|| BusError::DeserializationFailed("Message has no payload".to_string()))?;
    bincode::deserialize::<SerializedMessage>(payload)
        .map_err(|e| BusError::DeserializationFailed(format!("Failed to deserialize message: {e}")))
}

impl MessageBus for RedpandaMessageBus {
    fn dispatch(
        &self,
        topic: &str,
        message: &SerializedMessage,
        delay: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            match delay {
                Some(delay) if !delay.is_zero() => {
                    let producer = self.producer.clone();
                    tracing::debug!(
                        topic = %topic,
                        message_type = %message.message_type,
                        delay_secs = delay.as_secs(),
                        "Message scheduled"
                    );
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = Self::produce(&producer, &topic, &message, timeout).await {
                            tracing::error!(
                                topic = %topic,
                                message_type = %message.message_type,
                                error = %e,
                                "Scheduled message lost"
                            );
                        }
                    });
                    Ok(())
                },
                _ => Self::produce(&self.producer, &topic, &message, timeout).await,
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group,
                buffer_size,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(received) = stream.next().await {
                    match received {
                        Ok(message) => {
                            let decoded = decode(&message);
                            if let Ok(decoded) = &decoded {
                                tracing::trace!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    message_type = %decoded.message_type,
                                    "Received message"
                                );
                            }

                            // Commit only once the subscriber holds the message.
                            if tx.send(decoded).await.is_err() {
                                tracing::debug!("Subscriber dropped, stopping consumer");
                                break;
                            }

                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        },
                        Err(e) => {
                            let err =
                                BusError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
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
}
