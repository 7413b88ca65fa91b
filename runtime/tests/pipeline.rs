//! Integration tests for the event pipeline
//!
//! Drives a full mediator (listener, worker pool, business step) against
//! scripted sources and checks routing, ordering, metrics and health.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)] // Test arithmetic on small counts

use changefeed_core::{ResumeTokenStore, WorkerId};
use changefeed_runtime::dispatch::partition;
use changefeed_runtime::{
    ListenerState, Mediator, MediatorConfig, MetricsRegistry, MetricsServer,
};
use changefeed_testing::{
    InMemoryResumeTokenStore, RecordingHandler, ScriptedChangeSource, Session, fixtures,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ============================================================================
// Test Fixtures
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    mediator: Mediator,
    handler: RecordingHandler,
    store: InMemoryResumeTokenStore,
    registry: Arc<MetricsRegistry>,
}

fn harness(collection: &str, workers: usize, sessions: Vec<Session>) -> Harness {
    let handler = RecordingHandler::new(collection);
    let store = InMemoryResumeTokenStore::new();
    let registry = Arc::new(MetricsRegistry::new());
    let shared: Arc<dyn ResumeTokenStore> = Arc::new(store.clone());

    let mediator = Mediator::builder(MediatorConfig::new(workers))
        .store(shared)
        .metrics(Arc::clone(&registry))
        .bind(
            Arc::new(handler.clone()),
            Arc::new(ScriptedChangeSource::new(collection, sessions)),
        )
        .build()
        .unwrap();

    Harness {
        mediator,
        handler,
        store,
        registry,
    }
}

/// First key `k<i>` that routes to `worker` among `workers`.
fn key_for_worker(worker: usize, workers: usize) -> String {
    (0..)
        .map(|i| format!("k{i}"))
        .find(|key| partition(key, workers) == worker)
        .unwrap()
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ============================================================================
// Routing and ordering
// ============================================================================

#[tokio::test]
async fn same_key_events_stay_on_one_worker_in_order() {
    let mut h = harness("orders", 4, vec![Session::events(fixtures::sequence("A", 1000))]);
    h.mediator.start().unwrap();

    assert!(h.handler.wait_for(1000, WAIT).await);
    let report = h.mediator.shutdown(WAIT).await;
    assert!(!report.timed_out);

    let sequence: Vec<u32> = h
        .handler
        .received()
        .iter()
        .map(|e| e.cluster_time.unwrap().increment)
        .collect();
    assert_eq!(sequence, (1..=1000).collect::<Vec<_>>());

    let owner = WorkerId(partition("A", 4));
    let records = h.store.records("orders");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].worker, owner.to_string());
    assert_eq!(records[0].resume_token, fixtures::token(1000));
}

#[test]
fn distinct_keys_spread_evenly() {
    let mut per_worker: HashMap<usize, usize> = HashMap::new();
    for event in fixtures::distinct_keys(10_000) {
        let key = event.dispatch_key().unwrap();
        *per_worker.entry(partition(&key, 4)).or_default() += 1;
    }

    assert_eq!(per_worker.len(), 4);
    let max = *per_worker.values().max().unwrap() as f64;
    let min = *per_worker.values().min().unwrap() as f64;
    assert!(max / min <= 1.3, "uneven spread: {per_worker:?}");
}

#[tokio::test]
async fn distinct_keys_are_all_handled_and_checkpointed_per_worker() {
    let mut h = harness("users", 4, vec![Session::events(fixtures::distinct_keys(2_000))]);
    h.mediator.start().unwrap();

    assert!(h.handler.wait_for(2_000, WAIT).await);
    h.mediator.shutdown(WAIT).await;

    let metrics = h.registry.get("users").unwrap();
    assert_eq!(metrics.handled(), 2_000);
    assert_eq!(metrics.succeeded(), 2_000);

    let records = h.store.records("users");
    assert_eq!(records.len(), 4);
    for record in records {
        let worker: WorkerId = record.worker.parse().unwrap();
        let last_seq = fixtures::sequence_of(&record.resume_token).unwrap();
        let last_key = (last_seq - 1).to_string();
        assert_eq!(partition(&last_key, 4), worker.index());
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn worker_gauges_carry_worker_label() {
    let key = key_for_worker(2, 4);
    let events: Vec<_> = (1..=10).map(|seq| fixtures::insert(key.as_str(), seq)).collect();
    let mut h = harness("orders", 4, vec![Session::events(events)]);
    h.mediator.start().unwrap();

    assert!(h.handler.wait_for(10, WAIT).await);
    h.mediator.shutdown(WAIT).await;

    let text = h.registry.render();
    assert!(text.contains("orders_events_handled_total 10"));
    assert!(text.contains("orders_events_success_total 10"));
    assert!(text.contains("orders_event_lag_per_worker{worker=\"w2\"}"));
    assert!(text.contains("orders_tps_per_worker{worker=\"w2\"}"));
    assert!(!text.contains("worker=\"w0\""));

    let metrics = h.registry.get("orders").unwrap();
    assert!(metrics.last_lag(WorkerId(2)).unwrap() > 0.0);
    assert!(metrics.last_tps(WorkerId(2)).unwrap() > 0.0);
}

#[tokio::test]
async fn failures_count_as_handled_but_not_successful() {
    let events = vec![
        fixtures::insert("ok", 1),
        fixtures::insert("bad", 2),
        fixtures::insert("boom", 3),
        fixtures::insert("ok", 4),
    ];
    let handler = RecordingHandler::new("orders").failing_on("bad").panicking_on("boom");
    let store = InMemoryResumeTokenStore::new();
    let registry = Arc::new(MetricsRegistry::new());
    let mut mediator = Mediator::builder(MediatorConfig::new(1))
        .store(Arc::new(store.clone()))
        .metrics(Arc::clone(&registry))
        .bind(
            Arc::new(handler.clone()),
            Arc::new(ScriptedChangeSource::new("orders", vec![Session::events(events)])),
        )
        .build()
        .unwrap();
    mediator.start().unwrap();

    assert!(handler.wait_for(4, WAIT).await);
    mediator.shutdown(WAIT).await;

    let metrics = registry.get("orders").unwrap();
    assert_eq!(metrics.handled(), 4);
    assert_eq!(metrics.succeeded(), 2);
    assert_eq!(
        store.record("orders", WorkerId(0)).unwrap().resume_token,
        fixtures::token(4)
    );
}

#[tokio::test]
async fn events_without_key_are_counted_and_skipped() {
    let events = vec![fixtures::malformed(1), fixtures::insert("A", 2)];
    let mut h = harness("orders", 2, vec![Session::events(events)]);
    h.mediator.start().unwrap();

    assert!(h.handler.wait_for(1, WAIT).await);
    h.mediator.shutdown(WAIT).await;

    let metrics = h.registry.get("orders").unwrap();
    assert_eq!(metrics.handled(), 2);
    assert_eq!(metrics.succeeded(), 1);
    assert_eq!(h.handler.received_keys(), vec!["A"]);
}

// ============================================================================
// Health and scrape endpoint
// ============================================================================

#[tokio::test]
async fn scrape_server_reports_metrics_and_listener_health() {
    let mut h = harness("orders", 2, vec![Session::events(fixtures::sequence("A", 3))]);
    h.mediator.start().unwrap();
    assert!(h.handler.wait_for(3, WAIT).await);

    let states = h.mediator.listener_states();
    let streaming = states
        .wait_for("orders", WAIT, |s| *s == ListenerState::Streaming)
        .await;
    assert_eq!(streaming, Some(ListenerState::Streaming));

    let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&h.registry))
        .await
        .unwrap()
        .with_listener_states(states);
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = server.spawn(async move {
        let _ = stop_rx.await;
    });

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains("\"listener:orders\""));
    assert!(health.contains("\"streaming\""));

    h.mediator.shutdown(WAIT).await;
    let metrics = http_get(addr, "/metrics").await;
    assert!(metrics.contains("orders_events_handled_total 3"));

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
