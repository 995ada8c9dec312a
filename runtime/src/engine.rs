//! Transition engine.
//!
//! The imperative shell around [`marksign_core::transition::plan`]: it loads
//! the event a command names, plans the transition, commits it through the
//! store's compare-and-swap and then announces it on the bus.
//!
//! # Execution
//!
//! Every call gets a correlation id, attached to its tracing span and to any
//! [`SignError::ValidationFailed`] it returns. A batch is validated in full
//! before anything is written, and committed as one unit.
//!
//! Publishing `SignChanged` happens after the commit and is best effort: it is
//! retried with backoff, and a final failure is logged and counted but never
//! undoes the transition.

use crate::metrics::{BusMetrics, SignMetrics};
use crate::retry::{RetryPolicy, retry_with_backoff};
use marksign_core::{SignError, StoreError};
use marksign_core::bus::MessageBus;
use marksign_core::environment::Clock;
use marksign_core::ids::{SignEventId, SignId};
use marksign_core::message::{EVENTS_TOPIC, Envelope, SignMessage};
use marksign_core::sign::{AllocationKey, SignEvent, SignRegistration};
use marksign_core::status::SignStatus;
use marksign_core::store::{Claim, NewClaim, SignStore};
use marksign_core::transition::{SignCommand, Transition, Violation, admit, plan};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Engine settings.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Topic for `SignChanged` notifications.
    pub events_topic: String,
    /// Backoff for publishing notifications.
    pub publish_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            events_topic: EVENTS_TOPIC.to_string(),
            publish_policy: RetryPolicy::default(),
        }
    }
}

/// Validates and commits sign transitions.
#[derive(Clone)]
pub struct TransitionEngine {
    store: Arc<dyn SignStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl TransitionEngine {
    /// Engine with default settings.
    #[must_use]
    pub fn new(store: Arc<dyn SignStore>, bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, bus, clock, EngineConfig::default())
    }

    /// Engine with explicit settings.
    #[must_use]
    pub fn with_config(
        store: Arc<dyn SignStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    /// Store the engine commits to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SignStore> {
        &self.store
    }

    /// Clock the engine stamps events with.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a new sign. Returns its first `New` event.
    ///
    /// # Errors
    ///
    /// - [`SignError::ValidationFailed`] for a malformed code, a code already
    ///   registered, or an invalid invariable
    /// - [`SignError::Storage`] on persistence failure
    pub async fn register(&self, registration: SignRegistration) -> Result<SignEvent, SignError> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("register_sign", %correlation_id);

        async move {
            let (sign, event) = admit(
                registration,
                SignId::new(),
                SignEventId::new(),
                self.clock.now(),
            )
            .map_err(|violation| rejected(correlation_id, violation))?;

            let code = sign.code.code.clone();
            self.store
                .insert(sign, event.clone())
                .await
                .map_err(|e| SignError::from_store(e, correlation_id))?;

            SignMetrics::record_registered();
            tracing::info!(sign_id = %event.sign_id, event_id = %event.id, %code, "Sign registered");
            Ok(event)
        }
        .instrument(span)
        .await
    }

    /// Apply `command` to the sign whose current event is `event_id`.
    ///
    /// # Errors
    ///
    /// - [`SignError::NotFound`] if the event is unknown
    /// - [`SignError::ValidationFailed`] if the command is not legal from it
    /// - [`SignError::Conflict`] if the event is no longer current
    /// - [`SignError::Storage`] on persistence failure
    pub async fn apply_transition(
        &self,
        event_id: SignEventId,
        command: SignCommand,
    ) -> Result<SignEvent, SignError> {
        let mut events = self.apply_batch(vec![(event_id, command)]).await?;
        events
            .pop()
            .ok_or_else(|| SignError::Storage("batch commit returned no event".to_string()))
    }

    /// Apply `command` to whatever event of `sign_id` is current.
    ///
    /// # Errors
    ///
    /// As [`apply_transition`](Self::apply_transition), plus
    /// [`SignError::NotFound`] for an unknown sign.
    pub async fn transition_sign(
        &self,
        sign_id: SignId,
        command: SignCommand,
    ) -> Result<SignEvent, SignError> {
        let current = self
            .store
            .current_event(sign_id)
            .await
            .map_err(|e| SignError::from_store(e, Uuid::new_v4()))?
            .ok_or_else(|| SignError::NotFound(format!("sign {sign_id}")))?;
        self.apply_transition(current.id, command).await
    }

    /// Apply several commands as one unit of work.
    ///
    /// Every command is validated before anything is written; any violation
    /// rejects the whole batch. Returns the new events in input order.
    ///
    /// # Errors
    ///
    /// As [`apply_transition`](Self::apply_transition), for the first failing item.
    pub async fn apply_batch(
        &self,
        commands: Vec<(SignEventId, SignCommand)>,
    ) -> Result<Vec<SignEvent>, SignError> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("apply_transitions", %correlation_id, size = commands.len());

        async move {
            let now = self.clock.now();
            let mut transitions = Vec::with_capacity(commands.len());
            let mut previous = Vec::with_capacity(commands.len());

            for (event_id, command) in commands {
                let current = self
                    .store
                    .load_event(event_id)
                    .await
                    .map_err(|e| SignError::from_store(e, correlation_id))?
                    .ok_or_else(|| SignError::NotFound(format!("sign event {event_id}")))?;

                let transition = plan(&current, command, SignEventId::new(), now).map_err(|violation| {
                    tracing::warn!(
                        sign_id = %current.sign_id,
                        event_id = %current.id,
                        status = %current.status,
                        %violation,
                        "Transition rejected"
                    );
                    rejected(correlation_id, violation)
                })?;
                previous.push(current.status);
                transitions.push(transition);
            }

            self.store
                .commit(transitions.clone())
                .await
                .map_err(|e| {
                    let error = SignError::from_store(e, correlation_id);
                    if matches!(error, SignError::Conflict { .. }) {
                        SignMetrics::record_conflict();
                    }
                    tracing::debug!(%error, "Commit failed");
                    error
                })?;

            self.committed(&transitions, &previous).await;
            Ok(transitions.into_iter().map(|t| t.event).collect())
        }
        .instrument(span)
        .await
    }

    /// Apply `command` to the `quantity` oldest free signs matching `key`,
    /// all or none, through the store's exclusive claim.
    ///
    /// Concurrent callers never receive the same sign and never conflict
    /// while enough free signs remain.
    ///
    /// # Errors
    ///
    /// - [`SignError::ValidationFailed`] if the command is not legal from `New`
    /// - [`SignError::Storage`] on persistence failure
    pub async fn claim_new(
        &self,
        key: AllocationKey,
        quantity: usize,
        command: SignCommand,
    ) -> Result<Claim, SignError> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("claim_signs", %correlation_id, user = %key.user, quantity);

        async move {
            let claim = NewClaim {
                key,
                quantity,
                command,
                now: self.clock.now(),
            };
            let result = self.store.claim_new(claim).await.map_err(|e| match e {
                StoreError::Rejected(violation) => {
                    tracing::warn!(%violation, "Claim rejected");
                    rejected(correlation_id, violation)
                },
                e => SignError::from_store(e, correlation_id),
            })?;

            if let Claim::Claimed(transitions) = &result {
                let previous = vec![SignStatus::New; transitions.len()];
                self.committed(transitions, &previous).await;
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn committed(&self, transitions: &[Transition], previous: &[SignStatus]) {
        for (transition, from) in transitions.iter().zip(previous) {
            SignMetrics::record_transition(transition.event.status);
            tracing::info!(
                sign_id = %transition.sign_id,
                event_id = %transition.event.id,
                %from,
                to = %transition.event.status,
                "Sign transitioned"
            );
        }

        for transition in transitions {
            self.announce(transition).await;
        }
    }

    async fn announce(&self, transition: &Transition) {
        let envelope = Envelope::new(
            SignMessage::SignChanged {
                sign_id: transition.sign_id,
                event_id: transition.event.id,
                previous: transition.expected,
            },
            transition.event.created_at,
        );
        let wire = match envelope.encode() {
            Ok(wire) => wire,
            Err(e) => {
                BusMetrics::record_publish_error();
                tracing::error!(error = %e, sign_id = %transition.sign_id, "Failed to encode notification");
                return;
            },
        };

        let started = Instant::now();
        let topic = self.config.events_topic.as_str();
        match retry_with_backoff(self.config.publish_policy.clone(), || {
            self.bus.dispatch(topic, &wire, None)
        })
        .await
        {
            Ok(()) => BusMetrics::record_publish(started.elapsed()),
            Err(e) => {
                BusMetrics::record_publish_error();
                tracing::error!(
                    error = %e,
                    sign_id = %transition.sign_id,
                    event_id = %transition.event.id,
                    "Failed to publish SignChanged; transition stays committed"
                );
            },
        }
    }
}

fn rejected(correlation_id: Uuid, violation: Violation) -> SignError {
    SignMetrics::record_validation_failure();
    SignError::ValidationFailed {
        correlation_id,
        violation,
    }
}
