//! Bounded in-memory dead-letter queue.
//!
//! Used by tests and by deployments without a database-backed sink. When full,
//! the oldest entry is dropped.

use crate::metrics::DeadLetterMetrics;
use marksign_core::StoreError;
use marksign_core::dead_letter::{DeadLetter, DeadLetterSink};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// In-memory [`DeadLetterSink`].
///
/// # Example
///
/// ```
/// use marksign_runtime::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(1000);
/// assert!(dlq.is_empty());
/// assert_eq!(dlq.max_size(), 1000);
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `max_size` letters.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Append a letter, dropping the oldest if at capacity.
    pub fn push(&self, letter: DeadLetter) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            DeadLetterMetrics::record_dropped();
            tracing::warn!(
                max_size = self.max_size,
                "Dead-letter queue at capacity, dropping oldest entry"
            );
        }

        tracing::warn!(
            topic = %letter.topic,
            message_type = %letter.message.message_type,
            attempts = letter.attempts,
            error = %letter.error_message,
            "Message parked"
        );
        queue.push_back(letter);

        DeadLetterMetrics::record_parked();
        DeadLetterMetrics::record_size(queue.len());
    }

    /// Current number of letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every letter, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let letters: Vec<_> = queue.drain(..).collect();
        DeadLetterMetrics::record_size(0);
        tracing::info!(count = letters.len(), "Drained dead-letter queue");
        letters
    }

    /// Oldest letter, if any.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        self.push(letter);
        Box::pin(async { Ok(()) })
    }
}
