//! Change-feed consumer service.
//!
//! Watches every collection listed in `mongodb.collections`, dispatches each
//! change to a per-collection worker pool keyed by document id, and records
//! the resume token of every successfully handled change.
//!
//! # Running
//!
//! ```bash
//! CHANGEFEED_CONFIG=changefeed.toml cargo run -p changefeed-consumer
//! ```
//!
//! Then visit:
//! - Metrics endpoint: <http://localhost:8081/metrics>
//! - Health endpoint: <http://localhost:8081/health>

mod handlers;

use anyhow::Context;
use changefeed_core::{ChangeSource, ResumeTokenStore};
use changefeed_mongodb::{MongoChangeSource, MongoResumeTokenStore, connect};
use changefeed_runtime::signal::wait_for_signal;
use changefeed_runtime::{ConsumerConfig, Mediator, MetricsRegistry, MetricsServer};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,changefeed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting change-feed consumer");

    let config = ConsumerConfig::load().context("Failed to load configuration")?;
    let mediator_config = config.mediator_config()?;
    let shutdown_timeout = config.shutdown_timeout()?;
    info!(
        database = %config.mongodb.database,
        collections = ?config.mongodb.collections,
        workers = config.threadpool.nums,
        "Configuration loaded"
    );

    info!("Connecting to MongoDB...");
    let db = connect(&config.mongodb.uri, &config.mongodb.database)
        .await
        .context("Failed to connect to MongoDB")?;

    let store = MongoResumeTokenStore::new(&db, &config.mongodb.resumetoken.collection);
    store
        .ensure_indexes()
        .await
        .context("Failed to prepare the resume token collection")?;
    let store: Arc<dyn ResumeTokenStore> = Arc::new(store);

    let registry = MetricsRegistry::global();
    let server = MetricsServer::bind(config.metrics_addr(), Arc::clone(&registry))
        .await
        .context("Failed to bind the metrics port")?;

    let mut builder = Mediator::builder(mediator_config)
        .store(store)
        .metrics(registry);
    for collection in &config.mongodb.collections {
        let handler = handlers::handler_for(&db, collection);
        let source: Arc<dyn ChangeSource> =
            Arc::new(MongoChangeSource::new(db.collection(collection)));
        info!(collection = %collection, handler = handler.name(), "Binding handler");
        builder = builder.bind(handler, source);
    }
    let mut mediator = builder.build()?;

    mediator.start()?;

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = server
        .with_listener_states(mediator.listener_states())
        .spawn(async move {
            let _ = server_stopped.await;
        });

    info!("Consumer running, waiting for shutdown signal");
    wait_for_signal().await?;

    info!(timeout = ?shutdown_timeout, "Shutting down");
    let report = mediator.shutdown(shutdown_timeout).await;
    if report.timed_out {
        warn!(
            workers_aborted = report.workers_aborted,
            listeners_aborted = report.listeners_aborted,
            "Shutdown deadline elapsed"
        );
    }
    info!(
        listeners_stopped = report.listeners_stopped,
        workers_drained = report.workers_drained,
        "Mediator stopped"
    );

    let _ = stop_server.send(());
    match server.await {
        Ok(Ok(())) => info!("Metrics server stopped"),
        Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
        Err(e) => warn!(error = %e, "Metrics server task failed"),
    }

    Ok(())
}
