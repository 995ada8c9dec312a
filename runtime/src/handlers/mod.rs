//! Message handlers.
//!
//! One resolver per inbound message type. A resolver reports what happened as
//! an [`Outcome`]; only conditions that will not fix themselves become a
//! [`HandlerError`]. The [`Dispatcher`](crate::dispatcher::Dispatcher) turns
//! outcomes into acknowledgements, delayed requeues or dead letters.

mod document;
mod fulfill;
mod part;
mod reserve;
mod stock_return;

pub use document::DocumentResolver;
pub use fulfill::FulfillmentResolver;
pub use part::PartResolver;
pub use reserve::ReserveResolver;
pub use stock_return::StockReturnResolver;

use crate::allocator::Allocator;
use crate::dedup::{DedupGuard, Deduplicator};
use crate::documents::{BlobStore, DocumentError, DocumentFetcher};
use marksign_core::message::{Envelope, SignMessage};
use marksign_core::{SignError, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Delay before a message whose target is not there yet is redelivered.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// What a handler did with a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Side effect performed.
    Completed,
    /// Already handled by an earlier delivery.
    Duplicate,
    /// Try again later.
    Retry {
        /// How long to wait.
        delay: Duration,
        /// Why.
        reason: String,
    },
    /// Nothing to do and nothing to retry.
    Dropped {
        /// Why.
        reason: String,
    },
}

impl Outcome {
    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Retry { .. } => "retry",
            Self::Dropped { .. } => "dropped",
        }
    }

    pub(crate) fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Retry {
            delay,
            reason: reason.into(),
        }
    }

    pub(crate) fn dropped(reason: impl Into<String>) -> Self {
        Self::Dropped {
            reason: reason.into(),
        }
    }
}

/// Handler failures that retrying will not fix.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Stored data contradicts the message.
    #[error("Data inconsistency: {0}")]
    Inconsistent(String),

    /// Transition failed.
    #[error(transparent)]
    Sign(#[from] SignError),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Document could not be fetched or stored.
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Release a claimed guard on a failure path. The original failure wins; a
/// release error is only logged.
pub(crate) async fn release(guard: &DedupGuard) {
    if let Err(e) = guard.delete().await {
        tracing::error!(key = %guard.key(), error = %e, "Failed to release dedup guard");
    }
}

/// Every resolver, routed by message type.
pub struct Handlers {
    part: PartResolver,
    reserve: ReserveResolver,
    fulfill: FulfillmentResolver,
    stock_return: StockReturnResolver,
    document: Option<DocumentResolver>,
}

impl Handlers {
    /// Resolvers committing through `allocator` and guarded by `dedup`.
    ///
    /// `DocumentLinked` messages are dropped until
    /// [`with_documents`](Self::with_documents) is called.
    #[must_use]
    pub fn new(allocator: Allocator, dedup: Deduplicator) -> Self {
        let engine = Arc::clone(allocator.engine());
        Self {
            part: PartResolver::new(Arc::clone(&engine), dedup.clone()),
            reserve: ReserveResolver::new(allocator, dedup.clone()),
            fulfill: FulfillmentResolver::new(Arc::clone(&engine)),
            stock_return: StockReturnResolver::new(engine, dedup),
            document: None,
        }
    }

    /// Enable linked-document download.
    #[must_use]
    pub fn with_documents(
        mut self,
        fetcher: Arc<dyn DocumentFetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let engine = Arc::clone(self.part.engine());
        let dedup = self.part.dedup().clone();
        self.document = Some(DocumentResolver::new(engine, dedup, fetcher, blobs));
        self
    }

    /// Delay used by every resolver when asking for a retry.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.part = self.part.with_retry_delay(delay);
        self.reserve = self.reserve.with_retry_delay(delay);
        self.fulfill = self.fulfill.with_retry_delay(delay);
        self.stock_return = self.stock_return.with_retry_delay(delay);
        self.document = self.document.map(|d| d.with_retry_delay(delay));
        self
    }

    /// Handle one message.
    ///
    /// # Errors
    ///
    /// The resolver's [`HandlerError`].
    pub async fn route(&self, envelope: &Envelope) -> Result<Outcome, HandlerError> {
        match &envelope.payload {
            SignMessage::PartScanned {
                user,
                fragment,
                part,
            } => self.part.handle(*user, fragment, *part).await,
            SignMessage::OrderReserved {
                order,
                product_item,
                key,
            } => self.reserve.handle(*order, *product_item, *key).await,
            SignMessage::OrderFulfilled {
                order,
                product_item,
            } => self.fulfill.handle(*order, *product_item).await,
            SignMessage::StockReceived { stock_event, order } => {
                self.stock_return.handle(*stock_event, *order).await
            },
            SignMessage::DocumentLinked { sign_id, url } => match &self.document {
                Some(resolver) => resolver.handle(*sign_id, url).await,
                None => Ok(Outcome::dropped("document download is not configured")),
            },
            SignMessage::SignChanged { .. } => Ok(Outcome::dropped("outbound notification")),
        }
    }
}
