use super::{DEFAULT_RETRY_DELAY, HandlerError, Outcome, release};
use crate::dedup::{Deduplicator, PART_NAMESPACE, SCAN_NAMESPACE};
use crate::engine::TransitionEngine;
use marksign_core::SignError;
use marksign_core::ids::{PartId, UserId};
use marksign_core::transition::SignCommand;
use std::sync::Arc;
use std::time::Duration;

/// Moves a scanned sign into a part.
///
/// The sign is looked up by a fragment of its code. A sign that does not exist
/// yet is usually still being registered, so the message is retried. Once the
/// part is set, the scan-level guard claimed by the scanning front end is
/// cleared so the same label can be scanned again later.
#[derive(Clone)]
pub struct PartResolver {
    engine: Arc<TransitionEngine>,
    dedup: Deduplicator,
    retry_delay: Duration,
}

impl PartResolver {
    /// Resolver over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<TransitionEngine>, dedup: Deduplicator) -> Self {
        Self {
            engine,
            dedup,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub(super) const fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    pub(super) const fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Handle a `PartScanned` message.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn handle(
        &self,
        user: UserId,
        fragment: &str,
        part: PartId,
    ) -> Result<Outcome, HandlerError> {
        // An empty fragment is a substring of every code.
        if fragment.trim().is_empty() {
            tracing::warn!(%user, %part, "Part scan without a code fragment");
            return Ok(Outcome::dropped("empty fragment"));
        }

        let part_token = part.to_string();
        let guard = self
            .dedup
            .namespace(PART_NAMESPACE)
            .deduplicate(&[fragment, part_token.as_str()]);
        if guard.is_executed().await? {
            return Ok(Outcome::Duplicate);
        }

        let found = match self
            .engine
            .store()
            .find_by_code_fragment(user, fragment.to_string())
            .await
        {
            Ok(found) => found,
            Err(e) => {
                release(&guard).await;
                return Err(e.into());
            },
        };

        let Some(current) = found else {
            release(&guard).await;
            tracing::info!(%fragment, %part, "No sign matches the scanned fragment yet");
            return Ok(Outcome::retry(self.retry_delay, "no sign matches the fragment"));
        };

        if current.invariable.part != Some(part) {
            match self
                .engine
                .apply_transition(current.id, SignCommand::amend().with_part(part))
                .await
            {
                Ok(_) => {},
                Err(e) if e.is_retryable() => {
                    release(&guard).await;
                    return Ok(Outcome::retry(self.retry_delay, e.to_string()));
                },
                Err(SignError::ValidationFailed { violation, .. }) => {
                    release(&guard).await;
                    tracing::warn!(sign_id = %current.sign_id, %violation, "Part not assignable");
                    return Ok(Outcome::dropped(violation.to_string()));
                },
                Err(e) => {
                    release(&guard).await;
                    return Err(e.into());
                },
            }
        }

        guard.mark_done().await?;
        self.dedup
            .namespace(SCAN_NAMESPACE)
            .deduplicate(&[fragment])
            .delete()
            .await?;
        tracing::info!(sign_id = %current.sign_id, %part, "Part assigned");
        Ok(Outcome::Completed)
    }
}
