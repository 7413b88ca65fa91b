//! Lifecycle owner for every listener and worker pool.
//!
//! The [`Mediator`] is the entry point of the consumer. It is assembled from an
//! explicit [`MediatorConfig`], a resume-token store, a metrics registry and one
//! `(handler, source)` binding per watched collection:
//!
//! ```rust,ignore
//! let mut mediator = Mediator::builder(config)
//!     .store(Arc::new(MongoResumeTokenStore::new(&db, "resumeTokens")))
//!     .metrics(MetricsRegistry::global())
//!     .bind(orders_handler, orders_source)
//!     .bind(users_handler, users_source)
//!     .build()?;
//!
//! mediator.start()?;
//! wait_for_signal().await?;
//! let report = mediator.shutdown(Duration::from_secs(30)).await;
//! ```
//!
//! # Shutdown
//!
//! `shutdown(timeout)` works against a single deadline:
//!
//! 1. every listener is told to stop and awaited (stragglers are aborted)
//! 2. each pool's queues close and workers finish what is already queued
//! 3. workers still busy at the deadline are aborted
//!
//! Calling it again, or before `start`, is a no-op.

use crate::dispatch::WorkerPool;
use crate::listener::{Listener, ListenerState, ListenerStates};
use crate::metrics::MetricsRegistry;
use crate::retry::RetryPolicy;
use crate::step::BusinessStep;
use crate::tps::DEFAULT_ALPHA;
use changefeed_core::checkpoint::ResumeTokenStore;
use changefeed_core::handler::Handler;
use changefeed_core::source::ChangeSource;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default bound for `shutdown` used by the consumer binary.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from building or starting a [`Mediator`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediatorError {
    /// No resume-token store was supplied
    #[error("No resume token store configured")]
    MissingStore,
    /// No collection was bound
    #[error("No collections bound")]
    NoBindings,
    /// Fan-out must be at least one
    #[error("Worker count must be at least 1")]
    InvalidWorkerCount,
    /// A handler and its source watch different collections
    #[error("Handler for {handler} bound to source for {source_collection}")]
    CollectionMismatch {
        /// Handler's collection
        handler: String,
        /// Source's collection
        source_collection: String,
    },
    /// The same collection was bound twice
    #[error("Collection {0} bound more than once")]
    DuplicateCollection(String),
    /// `start` was called twice
    #[error("Mediator already started")]
    AlreadyStarted,
    /// `start` was called after `shutdown`
    #[error("Mediator already shut down")]
    AlreadyStopped,
    /// `start` was called outside a tokio runtime
    #[error("No tokio runtime available")]
    NoRuntime,
}

/// Runtime knobs for a [`Mediator`].
#[derive(Debug, Clone, PartialEq)]
pub struct MediatorConfig {
    /// Fan-out N per collection
    pub workers: usize,
    /// Listener reconnect policy
    pub retry: RetryPolicy,
    /// Bound used by callers for `shutdown`
    pub shutdown_timeout: Duration,
    /// TPS smoothing factor
    pub tps_alpha: f64,
    /// Per-worker queue bound (`None` = unbounded)
    pub queue_capacity: Option<usize>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            tps_alpha: DEFAULT_ALPHA,
            queue_capacity: None,
        }
    }
}

impl MediatorConfig {
    /// Config with `workers` per collection and defaults elsewhere.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown bound.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the TPS smoothing factor.
    #[must_use]
    pub const fn with_tps_alpha(mut self, alpha: f64) -> Self {
        self.tps_alpha = alpha;
        self
    }

    /// Bound each worker queue.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// What `shutdown` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Listeners that stopped on request
    pub listeners_stopped: usize,
    /// Listeners aborted at the deadline
    pub listeners_aborted: usize,
    /// Workers that drained their queue
    pub workers_drained: usize,
    /// Workers aborted at the deadline
    pub workers_aborted: usize,
    /// Whether the deadline was hit
    pub timed_out: bool,
}

struct Binding {
    handler: Arc<dyn Handler>,
    source: Arc<dyn ChangeSource>,
    state: Arc<watch::Sender<ListenerState>>,
}

/// Builder for [`Mediator`].
pub struct MediatorBuilder {
    config: MediatorConfig,
    store: Option<Arc<dyn ResumeTokenStore>>,
    metrics: Option<Arc<MetricsRegistry>>,
    bindings: Vec<(Arc<dyn Handler>, Arc<dyn ChangeSource>)>,
}

impl MediatorBuilder {
    /// Resume-token store shared by every worker.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ResumeTokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Metrics registry; defaults to [`MetricsRegistry::global`].
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind a handler to the source of its collection.
    #[must_use]
    pub fn bind(mut self, handler: Arc<dyn Handler>, source: Arc<dyn ChangeSource>) -> Self {
        self.bindings.push((handler, source));
        self
    }

    /// Validate and assemble the mediator.
    ///
    /// # Errors
    ///
    /// Returns a [`MediatorError`] if the store is missing, nothing is bound,
    /// the worker count is zero, or a binding is inconsistent or duplicated.
    pub fn build(self) -> Result<Mediator, MediatorError> {
        let store = self.store.ok_or(MediatorError::MissingStore)?;
        if self.bindings.is_empty() {
            return Err(MediatorError::NoBindings);
        }
        if self.config.workers == 0 {
            return Err(MediatorError::InvalidWorkerCount);
        }

        let mut seen = HashSet::new();
        let mut bindings = Vec::with_capacity(self.bindings.len());
        let mut receivers = Vec::with_capacity(self.bindings.len());

        for (handler, source) in self.bindings {
            if handler.collection() != source.collection() {
                return Err(MediatorError::CollectionMismatch {
                    handler: handler.collection().to_string(),
                    source_collection: source.collection().to_string(),
                });
            }
            if !seen.insert(source.collection().to_string()) {
                return Err(MediatorError::DuplicateCollection(
                    source.collection().to_string(),
                ));
            }
            let (tx, rx) = watch::channel(ListenerState::Connecting);
            receivers.push((source.collection().to_string(), rx));
            bindings.push(Binding {
                handler,
                source,
                state: Arc::new(tx),
            });
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Mediator {
            config: self.config,
            store,
            metrics: self.metrics.unwrap_or_else(MetricsRegistry::global),
            bindings,
            states: ListenerStates::new(receivers),
            shutdown,
            running: None,
            stopped: false,
        })
    }
}

struct Running {
    listeners: Vec<(String, JoinHandle<ListenerState>)>,
    pools: Vec<WorkerPool>,
}

/// Owner of every listener and worker pool.
pub struct Mediator {
    config: MediatorConfig,
    store: Arc<dyn ResumeTokenStore>,
    metrics: Arc<MetricsRegistry>,
    bindings: Vec<Binding>,
    states: ListenerStates,
    shutdown: watch::Sender<bool>,
    running: Option<Running>,
    stopped: bool,
}

impl Mediator {
    /// Start assembling a mediator.
    #[must_use]
    pub const fn builder(config: MediatorConfig) -> MediatorBuilder {
        MediatorBuilder {
            config,
            store: None,
            metrics: None,
            bindings: Vec::new(),
        }
    }

    /// Spawn one worker pool and one listener per bound collection.
    ///
    /// Returns as soon as everything is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`MediatorError::AlreadyStarted`] or
    /// [`MediatorError::AlreadyStopped`] on misuse and
    /// [`MediatorError::NoRuntime`] outside a tokio runtime.
    pub fn start(&mut self) -> Result<(), MediatorError> {
        if self.running.is_some() {
            return Err(MediatorError::AlreadyStarted);
        }
        if self.stopped {
            return Err(MediatorError::AlreadyStopped);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MediatorError::NoRuntime);
        }

        let mut listeners = Vec::with_capacity(self.bindings.len());
        let mut pools = Vec::with_capacity(self.bindings.len());

        for binding in &self.bindings {
            let collection = binding.source.collection().to_string();
            let metrics = self.metrics.get_or_create(&collection);

            let pool = WorkerPool::spawn(
                &collection,
                self.config.workers,
                self.config.queue_capacity,
                Arc::clone(&metrics),
                |worker| {
                    BusinessStep::new(
                        worker,
                        Arc::clone(&binding.handler),
                        Arc::clone(&self.store),
                        Arc::clone(&metrics),
                        self.config.tps_alpha,
                    )
                },
            );
            let Some(sender) = pool.sender() else {
                continue;
            };

            let listener = Listener::new(
                Arc::clone(&binding.source),
                Arc::clone(&self.store),
                sender,
                metrics,
                self.config.retry.clone(),
                Arc::clone(&binding.state),
            );
            let handle = tokio::spawn(listener.run(self.shutdown.subscribe()));

            tracing::info!(
                collection = %collection,
                handler = binding.handler.name(),
                workers = self.config.workers,
                "Collection bound"
            );
            listeners.push((collection, handle));
            pools.push(pool);
        }

        self.running = Some(Running { listeners, pools });
        tracing::info!(collections = self.bindings.len(), "Mediator started");
        Ok(())
    }

    /// Stop listeners, drain pools, and force-terminate whatever is left at
    /// `timeout`. Idempotent.
    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        self.stopped = true;
        self.shutdown.send_replace(true);

        let Some(running) = self.running.take() else {
            return ShutdownReport::default();
        };

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        tracing::info!(timeout_ms = timeout.as_millis(), "Mediator shutting down");

        for (collection, mut handle) in running.listeners {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.listeners_stopped += 1,
                Err(_) => {
                    handle.abort();
                    // Cancellation drops the listener and its pool sender.
                    let _ = handle.await;
                    report.listeners_aborted += 1;
                    report.timed_out = true;
                    tracing::warn!(collection = %collection, "Listener did not stop in time, aborted");
                    if let Some(binding) = self
                        .bindings
                        .iter()
                        .find(|b| b.source.collection() == collection)
                    {
                        binding.state.send_replace(ListenerState::Stopped);
                    }
                }
            }
        }

        for pool in running.pools {
            let drained = pool.drain(deadline).await;
            report.workers_drained += drained.drained;
            report.workers_aborted += drained.aborted;
            if drained.aborted > 0 {
                report.timed_out = true;
            }
        }

        tracing::info!(
            listeners_stopped = report.listeners_stopped,
            listeners_aborted = report.listeners_aborted,
            workers_drained = report.workers_drained,
            workers_aborted = report.workers_aborted,
            timed_out = report.timed_out,
            "Mediator stopped"
        );
        report
    }

    /// Live view of every listener's state.
    #[must_use]
    pub fn listener_states(&self) -> ListenerStates {
        self.states.clone()
    }

    /// Metrics registry in use.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &MediatorConfig {
        &self.config
    }

    /// Whether `start` succeeded and `shutdown` has not run.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for Mediator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
