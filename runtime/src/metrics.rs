//! Prometheus metrics for the change-feed consumer.
//!
//! Every watched collection gets one [`MetricSet`], created on first use and
//! shared afterwards. Metric names are prefixed with the collection name:
//!
//! | Metric | Type | Labels |
//! |---|---|---|
//! | `<coll>_events_handled_total` | counter | |
//! | `<coll>_events_success_total` | counter | |
//! | `<coll>_events_dropped_total` | counter | |
//! | `<coll>_event_lag_per_worker` | gauge (ms) | `worker` |
//! | `<coll>_tps_per_worker` | gauge | `worker` |
//! | `<coll>_event_process_duration_seconds` | histogram | |
//! | `<coll>_p99_processing_time_millis` | histogram | |
//!
//! The registry owns its own Prometheus recorder instead of installing a global
//! one, so several registries can coexist in one test binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use changefeed_runtime::metrics::{MetricsRegistry, MetricsServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MetricsRegistry::global();
//! let server = MetricsServer::bind("0.0.0.0:8081".parse()?, Arc::clone(&registry)).await?;
//!
//! // Metrics available at http://localhost:8081/metrics
//! let _task = server.spawn(std::future::pending());
//! # Ok(())
//! # }
//! ```

use crate::health::HealthReport;
use crate::listener::ListenerStates;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use changefeed_core::WorkerId;
use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use once_cell::sync::Lazy;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Buckets for `*_duration_seconds` histograms.
const SECONDS_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for `*_processing_time_millis` histograms.
const MILLIS_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

static GLOBAL: Lazy<Arc<MetricsRegistry>> = Lazy::new(|| Arc::new(MetricsRegistry::new()));

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
    /// HTTP server stopped with an error
    #[error("Metrics server failed: {0}")]
    Serve(String),
}

/// Metric-name prefix for a collection.
///
/// Characters Prometheus does not allow in metric names become `_`; a leading
/// digit gets a `_` prepended.
#[must_use]
pub fn metric_prefix(collection: &str) -> String {
    let mut prefix: String = collection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if prefix.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        prefix.insert(0, '_');
    }
    prefix
}

/// Per-worker gauges plus mirrors of their last values.
#[derive(Clone)]
struct WorkerGauges {
    lag: Gauge,
    tps: Gauge,
    last_lag: Arc<AtomicU64>,
    last_tps: Arc<AtomicU64>,
}

/// The instruments of one collection.
pub struct MetricSet {
    collection: String,
    prefix: String,
    recorder: Arc<PrometheusRecorder>,
    handled: Counter,
    success: Counter,
    dropped: Counter,
    duration_seconds: Histogram,
    processing_millis: Histogram,
    workers: DashMap<WorkerId, WorkerGauges>,
    handled_count: AtomicU64,
    success_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl std::fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSet")
            .field("collection", &self.collection)
            .field("handled", &self.handled())
            .field("succeeded", &self.succeeded())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl MetricSet {
    fn register(collection: &str, recorder: Arc<PrometheusRecorder>) -> Self {
        let prefix = metric_prefix(collection);
        let name = |suffix: &str| format!("{prefix}_{suffix}");

        describe(&recorder, &name("events_handled_total"), "Events dispatched to the handler", None);
        describe(&recorder, &name("events_success_total"), "Events the handler processed successfully", None);
        describe(&recorder, &name("events_dropped_total"), "Events dropped because a worker queue was full", None);
        describe(&recorder, &name("event_lag_per_worker"), "Milliseconds between cluster time and handler start", Some(Unit::Milliseconds));
        describe(&recorder, &name("tps_per_worker"), "Smoothed events per second", None);
        describe(&recorder, &name("event_process_duration_seconds"), "Handler duration", Some(Unit::Seconds));
        describe(&recorder, &name("p99_processing_time_millis"), "Handler duration in milliseconds", Some(Unit::Milliseconds));

        let handled = recorder.register_counter(&Key::from_name(name("events_handled_total")), &metadata());
        let success = recorder.register_counter(&Key::from_name(name("events_success_total")), &metadata());
        let dropped = recorder.register_counter(&Key::from_name(name("events_dropped_total")), &metadata());
        let duration_seconds = recorder.register_histogram(
            &Key::from_name(name("event_process_duration_seconds")),
            &metadata(),
        );
        let processing_millis = recorder.register_histogram(
            &Key::from_name(name("p99_processing_time_millis")),
            &metadata(),
        );

        Self {
            collection: collection.to_string(),
            prefix,
            recorder,
            handled,
            success,
            dropped,
            duration_seconds,
            processing_millis,
            workers: DashMap::new(),
            handled_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    fn worker(&self, worker: WorkerId) -> WorkerGauges {
        if let Some(gauges) = self.workers.get(&worker) {
            return gauges.clone();
        }
        self.workers
            .entry(worker)
            .or_insert_with(|| {
                let labels = vec![Label::new("worker", worker.to_string())];
                let key = |suffix: &str| {
                    Key::from_parts(format!("{}_{suffix}", self.prefix), labels.clone())
                };
                WorkerGauges {
                    lag: self.recorder.register_gauge(&key("event_lag_per_worker"), &metadata()),
                    tps: self.recorder.register_gauge(&key("tps_per_worker"), &metadata()),
                    last_lag: Arc::new(AtomicU64::new(0.0_f64.to_bits())),
                    last_tps: Arc::new(AtomicU64::new(0.0_f64.to_bits())),
                }
            })
            .clone()
    }

    /// Collection these instruments belong to.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Count an event handed to the handler.
    pub fn record_handled(&self) {
        self.handled_count.fetch_add(1, Ordering::SeqCst);
        self.handled.increment(1);
    }

    /// Count an event the handler processed successfully.
    pub fn record_success(&self) {
        self.success_count.fetch_add(1, Ordering::SeqCst);
        self.success.increment(1);
    }

    /// Count an event dropped at a full queue.
    pub fn record_dropped(&self) {
        self.dropped_count.fetch_add(1, Ordering::SeqCst);
        self.dropped.increment(1);
    }

    /// Set the lag gauge of `worker` (milliseconds).
    pub fn set_lag(&self, worker: WorkerId, lag_millis: f64) {
        let gauges = self.worker(worker);
        gauges.last_lag.store(lag_millis.to_bits(), Ordering::SeqCst);
        gauges.lag.set(lag_millis);
    }

    /// Set the throughput gauge of `worker`.
    pub fn set_tps(&self, worker: WorkerId, tps: f64) {
        let gauges = self.worker(worker);
        gauges.last_tps.store(tps.to_bits(), Ordering::SeqCst);
        gauges.tps.set(tps);
    }

    /// Observe a handler duration into both histograms.
    pub fn record_duration(&self, elapsed: Duration) {
        self.duration_seconds.record(elapsed.as_secs_f64());
        self.processing_millis.record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Events handed to the handler so far.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.handled_count.load(Ordering::SeqCst)
    }

    /// Events handled successfully so far.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.success_count.load(Ordering::SeqCst)
    }

    /// Events dropped at full queues so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_count.load(Ordering::SeqCst)
    }

    /// Last lag set for `worker`, if any.
    #[must_use]
    pub fn last_lag(&self, worker: WorkerId) -> Option<f64> {
        self.workers
            .get(&worker)
            .map(|g| f64::from_bits(g.last_lag.load(Ordering::SeqCst)))
    }

    /// Last throughput set for `worker`, if any.
    #[must_use]
    pub fn last_tps(&self, worker: WorkerId) -> Option<f64> {
        self.workers
            .get(&worker)
            .map(|g| f64::from_bits(g.last_tps.load(Ordering::SeqCst)))
    }
}

fn describe(recorder: &PrometheusRecorder, name: &str, help: &'static str, unit: Option<Unit>) {
    let key = KeyName::from(name.to_string());
    if name.ends_with("_total") {
        recorder.describe_counter(key, unit, help.into());
    } else if name.ends_with("duration_seconds") || name.ends_with("processing_time_millis") {
        recorder.describe_histogram(key, unit, help.into());
    } else {
        recorder.describe_gauge(key, unit, help.into());
    }
}

fn build_recorder() -> PrometheusRecorder {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), SECONDS_BUCKETS)
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Suffix("processing_time_millis".to_string()),
                MILLIS_BUCKETS,
            )
        });
    match builder {
        Ok(builder) => builder.build_recorder(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid histogram buckets, falling back to summaries");
            PrometheusBuilder::new().build_recorder()
        }
    }
}

/// Table of per-collection metric sets.
///
/// `get_or_create` is safe to race: the set for a collection is constructed at
/// most once and every caller receives the same instance.
pub struct MetricsRegistry {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
    sets: DashMap<String, Arc<MetricSet>>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create a registry with its own recorder.
    #[must_use]
    pub fn new() -> Self {
        let recorder = build_recorder();
        let handle = recorder.handle();
        Self {
            recorder: Arc::new(recorder),
            handle,
            sets: DashMap::new(),
        }
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Metric set for `collection`, created on first call.
    #[must_use]
    pub fn get_or_create(&self, collection: &str) -> Arc<MetricSet> {
        if let Some(set) = self.sets.get(collection) {
            return Arc::clone(&set);
        }
        let set = self
            .sets
            .entry(collection.to_string())
            .or_insert_with(|| {
                tracing::debug!(collection, "Registering collection metrics");
                Arc::new(MetricSet::register(collection, Arc::clone(&self.recorder)))
            });
        Arc::clone(&set)
    }

    /// Metric set for `collection`, if one was created.
    #[must_use]
    pub fn get(&self, collection: &str) -> Option<Arc<MetricSet>> {
        self.sets.get(collection).map(|s| Arc::clone(&s))
    }

    /// Collections with a metric set, sorted.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Render all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<MetricsRegistry>,
    listeners: Option<ListenerStates>,
}

async fn render_metrics(State(state): State<ServerState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.render(),
    )
}

async fn render_health(State(state): State<ServerState>) -> impl IntoResponse {
    let report = state
        .listeners
        .as_ref()
        .map_or_else(|| HealthReport::new(Vec::new()), HealthReport::from_listeners);
    let status = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, axum::Json(report))
}

/// Prometheus scrape server.
///
/// Serves `GET /metrics` (text exposition) and `GET /health` (JSON report).
/// The socket is bound in [`MetricsServer::bind`], so an unavailable port is
/// reported before anything else starts.
pub struct MetricsServer {
    listener: TcpListener,
    state: ServerState,
}

impl MetricsServer {
    /// Bind the scrape socket.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, registry: Arc<MetricsRegistry>) -> Result<Self, MetricsError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            "Metrics server bound - available at http://{}/metrics",
            addr
        );
        Ok(Self {
            listener,
            state: ServerState {
                registry,
                listeners: None,
            },
        })
    }

    /// Report listener states on `/health`.
    #[must_use]
    pub fn with_listener_states(mut self, states: ListenerStates) -> Self {
        self.state.listeners = Some(states);
        self
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Bind`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, MetricsError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Serve`] if the HTTP server fails.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), MetricsError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = Router::new()
            .route("/metrics", get(render_metrics))
            .route("/health", get(render_health))
            .with_state(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| MetricsError::Serve(e.to_string()))
    }

    /// Serve on a background task until `shutdown` resolves.
    pub fn spawn<F>(self, shutdown: F) -> JoinHandle<Result<(), MetricsError>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.serve(shutdown))
    }
}
