//! Linked document download.
//!
//! [`DocumentFetcher`] pulls a document over HTTP; [`BlobStore`] persists it
//! under a generated name. The extension is inferred from the response
//! content type.

use crate::retry::{RetryPolicy, retry_with_predicate};
use futures::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Maximum document size (50MB)
pub const MAX_DOCUMENT_SIZE: usize = 50 * 1024 * 1024;

/// Extension used when the content type is missing or unknown.
pub const FALLBACK_EXTENSION: &str = "bin";

/// Errors fetching or storing a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Request could not be completed.
    #[error("Failed to fetch {url}: {reason}")]
    Fetch {
        /// Document URL.
        url: String,
        /// Transport error.
        reason: String,
    },

    /// Server answered with a non-success status.
    #[error("Fetching {url} returned HTTP {status}")]
    Status {
        /// Document URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Body exceeded [`MAX_DOCUMENT_SIZE`].
    #[error("Document at {0} is larger than {MAX_DOCUMENT_SIZE} bytes")]
    TooLarge(String),

    /// Blob could not be written.
    #[error("Failed to store document: {0}")]
    Storage(String),
}

impl DocumentError {
    /// Transport failures and server-side statuses may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::TooLarge(_) | Self::Storage(_) => false,
        }
    }
}

/// A downloaded document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Body.
    pub bytes: Vec<u8>,
    /// `Content-Type` without parameters, if the server sent one.
    pub content_type: Option<String>,
}

impl FetchedDocument {
    /// File extension for the content type.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        extension_for(self.content_type.as_deref())
    }
}

/// Downloads documents.
pub trait DocumentFetcher: Send + Sync {
    /// Fetch `url`.
    ///
    /// # Errors
    ///
    /// [`DocumentError`] describing the failure.
    fn fetch(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedDocument, DocumentError>> + Send + '_>>;
}

/// Persists blobs by name.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` as `name`.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Storage`].
    fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>>;

    /// Remove `name`. Removing a missing blob succeeds.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Storage`].
    fn delete(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>>;
}

/// Extension for a MIME type, `bin` when unknown.
///
/// ```
/// use marksign_runtime::documents::extension_for;
///
/// assert_eq!(extension_for(Some("application/pdf")), "pdf");
/// assert_eq!(extension_for(Some("application/x-unknown")), "bin");
/// assert_eq!(extension_for(None), "bin");
/// ```
#[must_use]
pub fn extension_for(content_type: Option<&str>) -> &'static str {
    content_type
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|extensions| extensions.first().copied())
        .unwrap_or(FALLBACK_EXTENSION)
}

/// [`DocumentFetcher`] over reqwest.
#[derive(Clone, Debug)]
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpDocumentFetcher {
    /// Fetcher with a per-request `timeout` and a retry `policy` for transient failures.
    ///
    /// # Errors
    ///
    /// [`DocumentError::Fetch`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, DocumentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DocumentError::Fetch {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, policy })
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedDocument, DocumentError> {
        let fetch_error = |e: reqwest::Error| DocumentError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(fetch_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DocumentError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase());

        // Stream response with size limit
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(fetch_error)?;
            if bytes.len() + chunk.len() > MAX_DOCUMENT_SIZE {
                return Err(DocumentError::TooLarge(url.to_string()));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedDocument {
            bytes,
            content_type,
        })
    }
}

impl DocumentFetcher for HttpDocumentFetcher {
    fn fetch(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedDocument, DocumentError>> + Send + '_>> {
        let url = url.to_string();
        Box::pin(async move {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(DocumentError::Fetch {
                    url,
                    reason: "URL must start with http:// or https://".to_string(),
                });
            }
            retry_with_predicate(
                self.policy.clone(),
                || self.fetch_once(&url),
                DocumentError::is_transient,
            )
            .await
        })
    }
}

/// [`BlobStore`] writing files under a root directory.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Store under `root`, created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            check_name(&name)?;
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| DocumentError::Storage(e.to_string()))?;
            tokio::fs::write(self.root.join(&name), bytes)
                .await
                .map_err(|e| DocumentError::Storage(e.to_string()))?;
            tracing::debug!(%name, root = %self.root.display(), "Blob stored");
            Ok(())
        })
    }

    fn delete(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<(), DocumentError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            check_name(&name)?;
            match tokio::fs::remove_file(self.root.join(&name)).await {
                Ok(()) => {
                    tracing::debug!(%name, root = %self.root.display(), "Blob removed");
                    Ok(())
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DocumentError::Storage(e.to_string())),
            }
        })
    }
}

fn check_name(name: &str) -> Result<(), DocumentError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(DocumentError::Storage(format!("invalid blob name '{name}'")));
    }
    Ok(())
}
