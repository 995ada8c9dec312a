//! Marksign worker binary.
//!
//! Consumes sign lifecycle messages from Redpanda and applies them to the
//! Postgres sign store.

use anyhow::Context;
use marksign_core::bus::MessageBus;
use marksign_core::dead_letter::DeadLetterSink;
use marksign_core::dedup::DedupStore;
use marksign_core::environment::{Clock, SystemClock};
use marksign_postgres::{PostgresDeadLetterQueue, PostgresDedupStore, PostgresSignStore};
use marksign_redpanda::RedpandaMessageBus;
use marksign_runtime::documents::{FsBlobStore, HttpDocumentFetcher};
use marksign_runtime::metrics::MetricsServer;
use marksign_runtime::{
    Allocator, Deduplicator, Dispatcher, EngineConfig, Handlers, RetryPolicy, TransitionEngine,
};
use marksign_worker::config::Config;
use marksign_worker::purge;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marksign=info,marksign_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting marksign worker");

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        consumer_group = %config.redpanda.consumer_group,
        commands_topic = %config.redpanda.commands_topic,
        concurrency = config.dispatcher.concurrency,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.server.metrics_addr());
    if let Err(e) = metrics.serve() {
        warn!(error = %e, "Metrics server unavailable");
    }

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .idle_timeout(Duration::from_secs(config.postgres.idle_timeout))
        .connect(&config.postgres.url)
        .await
        .context("Failed to connect to database")?;
    marksign_postgres::migrate(&pool).await?;
    info!("Database ready");

    info!("Connecting to Redpanda...");
    let bus: Arc<dyn MessageBus> = Arc::new(
        RedpandaMessageBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .producer_acks(&config.redpanda.producer_acks)
            .compression(&config.redpanda.compression)
            .buffer_size(config.redpanda.buffer_size)
            .build()?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dedup_store: Arc<dyn DedupStore> = Arc::new(PostgresDedupStore::new(pool.clone()));

    let engine = Arc::new(TransitionEngine::with_config(
        Arc::new(PostgresSignStore::new(pool.clone())),
        Arc::clone(&bus),
        Arc::clone(&clock),
        EngineConfig {
            events_topic: config.redpanda.events_topic.clone(),
            publish_policy: RetryPolicy::default(),
        },
    ));
    let allocator = Allocator::new(engine);
    let dedup = Deduplicator::new(Arc::clone(&dedup_store)).with_lease(config.dispatcher.dedup_lease());

    let mut handlers = Handlers::new(allocator, dedup);
    if config.documents.enabled {
        let fetcher = HttpDocumentFetcher::new(
            Duration::from_secs(config.documents.fetch_timeout),
            RetryPolicy::builder()
                .max_retries(config.documents.fetch_retries)
                .build(),
        )?;
        handlers = handlers.with_documents(
            Arc::new(fetcher),
            Arc::new(FsBlobStore::new(config.documents.storage_dir())),
        );
        info!(dir = %config.documents.storage_dir, "Document download enabled");
    }
    let handlers = Arc::new(handlers.with_retry_delay(config.dispatcher.retry_delay()));

    let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(PostgresDeadLetterQueue::new(pool.clone()));
    let dispatcher = Dispatcher::new(bus, handlers, dead_letters, Arc::clone(&clock))
        .with_config(config.dispatcher.runtime(&config.redpanda.commands_topic));

    let purge_task = tokio::spawn(purge::run(
        dedup_store,
        clock,
        config.dispatcher.purge_interval(),
        config.dispatcher.retention(),
    ));

    info!(topic = %dispatcher.config().topic, "Worker running");
    tokio::select! {
        result = dispatcher.run() => {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher stopped");
            } else {
                warn!("Subscription ended");
            }
        }
        () = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    purge_task.abort();
    if tokio::time::timeout(
        Duration::from_secs(config.server.shutdown_timeout),
        pool.close(),
    )
    .await
    .is_err()
    {
        warn!("Database pool did not close in time");
    }

    info!("Worker stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
