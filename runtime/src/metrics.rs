//! Prometheus metrics.
//!
//! Metric families:
//! - `sign_*`: registrations, transitions by target status, allocation outcomes
//! - `dedup_*`: duplicate deliveries detected
//! - `handler_*`: handler outcomes by message type
//! - `bus_*`: publish latency and failures
//! - `dead_letters_*`, `retry_*`
//!
//! # Example
//!
//! ```rust,no_run
//! use marksign_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use marksign_core::status::SignStatus;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once served.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        register_metrics();
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Install the recorder without an HTTP listener; metrics are available
    /// through [`render`](Self::render).
    ///
    /// A recorder that is already installed (e.g. by another test) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            },
            Err(e) if e.to_string().contains("already initialized") => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            },
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Install the recorder and spawn the HTTP listener on the Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        self.handle = Some(recorder.handle());
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics exporter stopped");
            }
        });
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("sign_registered_total", "Signs registered");
    describe_counter!(
        "sign_transitions_total",
        "Committed transitions, labelled by target status"
    );
    describe_counter!(
        "sign_validation_failures_total",
        "Commands rejected by validation"
    );
    describe_counter!(
        "sign_conflicts_total",
        "Commits rejected because the current event moved"
    );
    describe_counter!(
        "sign_allocations_total",
        "Allocation attempts, labelled by outcome"
    );

    describe_counter!(
        "dedup_duplicates_total",
        "Deliveries skipped because their dedup key was already claimed"
    );

    describe_counter!(
        "handler_outcomes_total",
        "Handler outcomes, labelled by message type and outcome"
    );
    describe_histogram!(
        "handler_duration_seconds",
        "Time taken to handle one message"
    );

    describe_counter!("bus_published_total", "Notifications published");
    describe_counter!(
        "bus_publish_errors_total",
        "Notifications that could not be published"
    );
    describe_histogram!("bus_publish_duration_seconds", "Publish latency");
    describe_counter!("bus_requeued_total", "Messages requeued with a delay");

    describe_counter!("dead_letters_total", "Messages parked");
    describe_counter!(
        "dead_letters_dropped_total",
        "Parked messages dropped because the in-memory queue was full"
    );
    describe_gauge!("dead_letters_size", "In-memory dead-letter queue size");

    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their retries"
    );
}

/// Sign lifecycle metrics recorder.
pub struct SignMetrics;

impl SignMetrics {
    /// A sign was registered.
    pub fn record_registered() {
        counter!("sign_registered_total").increment(1);
    }

    /// A transition to `status` was committed.
    pub fn record_transition(status: SignStatus) {
        counter!("sign_transitions_total", "status" => status.as_str()).increment(1);
    }

    /// A command was rejected by validation.
    pub fn record_validation_failure() {
        counter!("sign_validation_failures_total").increment(1);
    }

    /// A commit lost a compare-and-swap.
    pub fn record_conflict() {
        counter!("sign_conflicts_total").increment(1);
    }

    /// Allocation finished with `outcome` (`allocated`, `not_available`).
    pub fn record_allocation(outcome: &'static str) {
        counter!("sign_allocations_total", "outcome" => outcome).increment(1);
    }
}

/// Dedup metrics recorder.
pub struct DedupMetrics;

impl DedupMetrics {
    /// A duplicate delivery was detected in `namespace`.
    pub fn record_duplicate(namespace: &str) {
        counter!("dedup_duplicates_total", "namespace" => namespace.to_string()).increment(1);
    }
}

/// Handler metrics recorder.
pub struct HandlerMetrics;

impl HandlerMetrics {
    /// A handler for `message_type` finished with `outcome` after `duration`.
    pub fn record_outcome(message_type: &'static str, outcome: &'static str, duration: Duration) {
        counter!(
            "handler_outcomes_total",
            "message_type" => message_type,
            "outcome" => outcome
        )
        .increment(1);
        histogram!("handler_duration_seconds", "message_type" => message_type)
            .record(duration.as_secs_f64());
    }
}

/// Bus metrics recorder.
pub struct BusMetrics;

impl BusMetrics {
    /// A notification was published.
    pub fn record_publish(duration: Duration) {
        counter!("bus_published_total").increment(1);
        histogram!("bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// A notification could not be published.
    pub fn record_publish_error() {
        counter!("bus_publish_errors_total").increment(1);
    }

    /// A message was requeued.
    pub fn record_requeue() {
        counter!("bus_requeued_total").increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// A message was parked.
    pub fn record_parked() {
        counter!("dead_letters_total").increment(1);
    }

    /// The in-memory queue dropped its oldest entry.
    pub fn record_dropped() {
        counter!("dead_letters_dropped_total").increment(1);
    }

    /// Current in-memory queue size.
    // Queue size is bounded by its capacity; f64 represents it exactly
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(size: usize) {
        gauge!("dead_letters_size").set(size as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
