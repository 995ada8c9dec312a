use super::{DEFAULT_RETRY_DELAY, HandlerError, Outcome, release};
use crate::dedup::{DOCUMENT_NAMESPACE, Deduplicator};
use crate::documents::{BlobStore, DocumentFetcher};
use crate::engine::TransitionEngine;
use marksign_core::ids::SignId;
use marksign_core::sign::CodeArtifact;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Downloads a document linked to a sign and records it as the sign's artifact.
#[derive(Clone)]
pub struct DocumentResolver {
    engine: Arc<TransitionEngine>,
    dedup: Deduplicator,
    fetcher: Arc<dyn DocumentFetcher>,
    blobs: Arc<dyn BlobStore>,
    retry_delay: Duration,
}

impl DocumentResolver {
    /// Resolver fetching through `fetcher` into `blobs`.
    #[must_use]
    pub fn new(
        engine: Arc<TransitionEngine>,
        dedup: Deduplicator,
        fetcher: Arc<dyn DocumentFetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            engine,
            dedup,
            fetcher,
            blobs,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Handle a `DocumentLinked` message.
    ///
    /// # Errors
    ///
    /// Permanent fetch failures and storage failures.
    pub async fn handle(&self, sign_id: SignId, url: &str) -> Result<Outcome, HandlerError> {
        let guard = self
            .dedup
            .namespace(DOCUMENT_NAMESPACE)
            .deduplicate(&[sign_id.to_string().as_str(), url]);
        if guard.is_executed().await? {
            return Ok(Outcome::Duplicate);
        }

        let result = self.download(sign_id, url).await;
        match result {
            Ok(Some(artifact)) => {
                guard.mark_done().await?;
                tracing::info!(%sign_id, file = %artifact.file_name(), "Document attached");
                Ok(Outcome::Completed)
            },
            Ok(None) => {
                release(&guard).await;
                Ok(Outcome::retry(self.retry_delay, format!("sign {sign_id} not registered yet")))
            },
            Err(HandlerError::Document(e)) if e.is_transient() => {
                release(&guard).await;
                tracing::warn!(%sign_id, error = %e, "Document fetch failed, will retry");
                Ok(Outcome::retry(self.retry_delay, e.to_string()))
            },
            Err(e) => {
                release(&guard).await;
                Err(e)
            },
        }
    }

    async fn download(&self, sign_id: SignId, url: &str) -> Result<Option<CodeArtifact>, HandlerError> {
        if self.engine.store().load_sign(sign_id).await?.is_none() {
            return Ok(None);
        }

        let document = self.fetcher.fetch(url).await?;
        let artifact = CodeArtifact {
            name: Uuid::new_v4().to_string(),
            extension: document.extension().to_string(),
            on_cdn: false,
        };
        let file = artifact.file_name();
        self.blobs.put(&file, document.bytes).await?;

        // A redelivery downloads under a fresh name, so an unattached blob would leak.
        if let Err(e) = self
            .engine
            .store()
            .attach_artifact(sign_id, artifact.clone())
            .await
        {
            if let Err(cleanup) = self.blobs.delete(&file).await {
                tracing::warn!(%sign_id, %file, error = %cleanup, "Failed to remove unattached document");
            }
            return Err(e.into());
        }
        Ok(Some(artifact))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::documents::{DocumentError, FetchedDocument};
    use marksign_core::store::SignStore;
    use marksign_testing::{
        InMemoryDedupStore, InMemoryMessageBus, InMemorySignStore, SCENARIO_CODE, Tenant,
        test_clock,
    };
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Fetcher that takes the sign store down while the download is in flight.
    struct OutageDuringFetch(InMemorySignStore);

    impl DocumentFetcher for OutageDuringFetch {
        fn fetch(
            &self,
            _url: &str,
        ) -> Pin<Box<dyn Future<Output = Result<FetchedDocument, DocumentError>> + Send + '_>> {
            self.0.set_unavailable(true);
            Box::pin(async {
                Ok(FetchedDocument {
                    bytes: b"%PDF-1.7".to_vec(),
                    content_type: Some("application/pdf".to_string()),
                })
            })
        }
    }

    #[derive(Default)]
    struct Blobs(Mutex<HashSet<String>>);

    impl BlobStore for Blobs {
        fn put(
            &self,
            name: &str,
            _bytes: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>> {
            self.0.lock().unwrap().insert(name.to_string());
            Box::pin(async { Ok(()) })
        }

        fn delete(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>> {
            self.0.lock().unwrap().remove(name);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn failed_attach_removes_the_stored_blob() {
        let store = InMemorySignStore::new();
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryMessageBus::new()),
            Arc::new(test_clock()),
        ));
        let sign = engine
            .register(Tenant::new().registration(SCENARIO_CODE))
            .await
            .unwrap();
        let blobs = Arc::new(Blobs::default());
        let resolver = DocumentResolver::new(
            engine,
            Deduplicator::new(Arc::new(InMemoryDedupStore::new())),
            Arc::new(OutageDuringFetch(store.clone())),
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
        );

        let result = resolver.handle(sign.sign_id, "https://docs.example/a.pdf").await;

        assert!(result.is_err());
        assert!(blobs.0.lock().unwrap().is_empty(), "no orphaned blob");
        store.set_unavailable(false);
        assert_eq!(store.load_sign(sign.sign_id).await.unwrap().unwrap().code.artifact, None);
    }
}
