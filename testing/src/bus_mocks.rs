//! In-memory message bus.
//!
//! Records every dispatch for assertions. Immediate dispatches are delivered
//! to live subscribers at once; delayed ones are held until
//! [`InMemoryMessageBus::release_delayed`] so tests control time.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use marksign_core::bus::{BusError, MessageBus, MessageStream};
use marksign_core::message::{Envelope, SerializedMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A recorded dispatch.
#[derive(Clone, Debug)]
pub struct Dispatched {
    /// Topic.
    pub topic: String,
    /// Message.
    pub message: SerializedMessage,
    /// Requested delay.
    pub delay: Option<Duration>,
}

impl Dispatched {
    /// Decode the envelope, if it decodes.
    #[must_use]
    pub fn envelope(&self) -> Option<Envelope> {
        Envelope::decode(&self.message).ok()
    }
}

type Subscriber = (Vec<String>, mpsc::UnboundedSender<SerializedMessage>);

#[derive(Debug, Default)]
struct BusState {
    log: Vec<Dispatched>,
    delayed: Vec<Dispatched>,
    subscribers: Vec<Subscriber>,
}

impl BusState {
    fn deliver(&mut self, topic: &str, message: &SerializedMessage) {
        self.subscribers.retain(|(topics, sender)| {
            if topics.iter().any(|t| t == topic) {
                sender.send(message.clone()).is_ok()
            } else {
                !sender.is_closed()
            }
        });
    }
}

/// In-memory [`MessageBus`].
///
/// # Example
///
/// ```
/// use marksign_testing::InMemoryMessageBus;
///
/// let bus = InMemoryMessageBus::new();
/// bus.fail_next_dispatches(2);
/// assert!(bus.dispatched().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch so far, in order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.state.lock().unwrap().log.clone()
    }

    /// Dispatches to one topic.
    #[must_use]
    pub fn dispatched_to(&self, topic: &str) -> Vec<Dispatched> {
        self.dispatched()
            .into_iter()
            .filter(|d| d.topic == topic)
            .collect()
    }

    /// Decoded envelopes dispatched to one topic.
    #[must_use]
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        self.dispatched_to(topic)
            .iter()
            .filter_map(Dispatched::envelope)
            .collect()
    }

    /// Delayed dispatches not yet released.
    #[must_use]
    pub fn pending_delayed(&self) -> usize {
        self.state.lock().unwrap().delayed.len()
    }

    /// Deliver every held delayed dispatch. Returns how many were released.
    pub fn release_delayed(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let delayed = std::mem::take(&mut state.delayed);
        for d in &delayed {
            state.deliver(&d.topic, &d.message);
        }
        delayed.len()
    }

    /// Live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }

    /// Make the next `n` dispatches fail.
    pub fn fail_next_dispatches(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MessageBus for InMemoryMessageBus {
    fn dispatch(
        &self,
        topic: &str,
        message: &SerializedMessage,
        delay: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let record = Dispatched {
            topic: topic.to_string(),
            message: message.clone(),
            delay,
        };
        Box::pin(async move {
            if self.take_failure() {
                return Err(BusError::DispatchFailed {
                    topic: record.topic,
                    reason: "injected failure".to_string(),
                });
            }
            let mut state = self.state.lock().unwrap();
            state.log.push(record.clone());
            if record.delay.is_some() {
                state.delayed.push(record);
            } else {
                state.deliver(&record.topic, &record.message);
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            self.state.lock().unwrap().subscribers.push((topics, sender));
            let stream = async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    yield Ok(message);
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
