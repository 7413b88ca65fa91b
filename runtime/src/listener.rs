//! Per-collection change-feed listener.
//!
//! A listener keeps one collection's change feed flowing into its worker pool.
//! It runs this state machine until it is stopped or gives up:
//!
//! ```text
//!              ┌──────────── backoff / invalidation ◄───────────┐
//!              ▼                                                │
//!        Connecting ──open──► Streaming ──fault / invalidate──► Retrying
//!              │                                                │
//!              └──── corrupted checkpoint ──► Terminated ◄── attempts exhausted
//! ```
//!
//! - **Connecting**: load the earliest checkpoint of the collection and open a
//!   cursor after it (or at the current tail), asking for `updateLookup`
//!   post-images and `whenAvailable` pre-images.
//! - **Streaming**: submit each event to the pool. An `invalidate` event ends
//!   the session. Events without a document key are logged and skipped.
//! - **Retrying**: transient and unexpected faults wait `d, 2d, 4d, ...` before
//!   reconnecting; invalidation reconnects at once. Either way the attempt
//!   counts toward the cap, and the counter resets once an event is delivered.
//! - **Terminated**: the attempt cap was reached or the checkpoint store holds
//!   an unreadable record. Other collections keep running.
//!
//! The current state is published on a `watch` channel; see [`ListenerStates`].

use crate::dispatch::{DispatchError, PoolSender, Submitted};
use crate::metrics::MetricSet;
use crate::retry::{Backoff, RetryPolicy};
use changefeed_core::checkpoint::ResumeTokenStore;
use changefeed_core::source::{ChangeSource, SourceError, WatchOptions};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle state of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Loading the checkpoint and opening the cursor
    Connecting,
    /// Cursor open, events flowing
    Streaming,
    /// Waiting before the next connection attempt
    Retrying {
        /// Consecutive failed attempts so far
        attempt: u32,
        /// Wait before reconnecting
        delay: Duration,
    },
    /// Gave up
    Terminated {
        /// Why
        reason: String,
    },
    /// Stopped by shutdown
    Stopped,
}

impl ListenerState {
    /// State name for logs and health output.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Retrying { .. } => "retrying",
            Self::Terminated { .. } => "terminated",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the listener will not run again.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Stopped)
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrying { attempt, delay } => {
                write!(f, "retrying (attempt {attempt}, delay {}ms)", delay.as_millis())
            }
            Self::Terminated { reason } => write!(f, "terminated: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Read-only view of every listener's state. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ListenerStates {
    entries: Arc<Vec<(String, watch::Receiver<ListenerState>)>>,
}

impl ListenerStates {
    pub(crate) fn new(entries: Vec<(String, watch::Receiver<ListenerState>)>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Current state of every listener, in binding order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ListenerState)> {
        self.entries
            .iter()
            .map(|(collection, rx)| (collection.clone(), rx.borrow().clone()))
            .collect()
    }

    /// Current state of the listener for `collection`.
    #[must_use]
    pub fn get(&self, collection: &str) -> Option<ListenerState> {
        self.entries
            .iter()
            .find(|(name, _)| name == collection)
            .map(|(_, rx)| rx.borrow().clone())
    }

    /// Wait until the listener for `collection` reaches a state matching
    /// `predicate`, or `timeout` elapses.
    ///
    /// Returns the matching state, or `None` on timeout or unknown collection.
    pub async fn wait_for<F>(
        &self,
        collection: &str,
        timeout: Duration,
        mut predicate: F,
    ) -> Option<ListenerState>
    where
        F: FnMut(&ListenerState) -> bool,
    {
        let mut rx = self
            .entries
            .iter()
            .find(|(name, _)| name == collection)
            .map(|(_, rx)| rx.clone())?;
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s))).await;
        match waited {
            Ok(Ok(state)) => Some(state.clone()),
            _ => None,
        }
    }
}

/// How a cursor session ended.
#[derive(Debug)]
enum SessionEnd {
    Invalidated,
    Failed(SourceError),
    Fatal(String),
}

/// One collection's listener.
pub struct Listener {
    collection: String,
    source: Arc<dyn ChangeSource>,
    store: Arc<dyn ResumeTokenStore>,
    pool: PoolSender,
    metrics: Arc<MetricSet>,
    backoff: Backoff,
    state: Arc<watch::Sender<ListenerState>>,
}

impl Listener {
    /// Create a listener feeding `pool` from `source`.
    #[must_use]
    pub fn new(
        source: Arc<dyn ChangeSource>,
        store: Arc<dyn ResumeTokenStore>,
        pool: PoolSender,
        metrics: Arc<MetricSet>,
        retry: RetryPolicy,
        state: Arc<watch::Sender<ListenerState>>,
    ) -> Self {
        Self {
            collection: source.collection().to_string(),
            source,
            store,
            pool,
            metrics,
            backoff: Backoff::new(retry),
            state,
        }
    }

    fn set_state(&self, state: ListenerState) {
        tracing::debug!(collection = %self.collection, state = %state, "Listener state");
        self.state.send_replace(state);
    }

    /// Run until `shutdown` turns `true` or the listener gives up.
    ///
    /// Returns the final state (`Stopped` or `Terminated`).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ListenerState {
        tracing::info!(collection = %self.collection, "Listener started");

        let final_state = loop {
            if *shutdown.borrow() {
                break ListenerState::Stopped;
            }
            self.set_state(ListenerState::Connecting);

            let end = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break ListenerState::Stopped,
                end = self.session() => end,
            };

            let delay = match end {
                SessionEnd::Fatal(reason) => {
                    tracing::error!(collection = %self.collection, reason = %reason, "Listener terminating");
                    break ListenerState::Terminated { reason };
                }
                SessionEnd::Invalidated => {
                    if !self.backoff.record_invalidation() {
                        break self.exhausted("change stream invalidated");
                    }
                    tracing::info!(
                        collection = %self.collection,
                        attempt = self.backoff.attempts(),
                        "Change stream invalidated, reopening"
                    );
                    Duration::ZERO
                }
                SessionEnd::Failed(error) => {
                    let Some(delay) = self.backoff.record_failure() else {
                        break self.exhausted(&error.to_string());
                    };
                    if error.is_transient() {
                        tracing::warn!(
                            collection = %self.collection,
                            attempt = self.backoff.attempts(),
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "Transient change stream failure, retrying"
                        );
                    } else {
                        tracing::error!(
                            collection = %self.collection,
                            attempt = self.backoff.attempts(),
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "Unexpected change stream failure, retrying"
                        );
                    }
                    delay
                }
            };

            self.set_state(ListenerState::Retrying {
                attempt: self.backoff.attempts(),
                delay,
            });
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break ListenerState::Stopped,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        };

        tracing::info!(collection = %self.collection, state = %final_state, "Listener finished");
        self.set_state(final_state.clone());
        final_state
    }

    fn exhausted(&self, last_error: &str) -> ListenerState {
        let reason = format!(
            "gave up after {} attempts: {last_error}",
            self.backoff.attempts()
        );
        tracing::error!(collection = %self.collection, reason = %reason, "Listener terminating");
        ListenerState::Terminated { reason }
    }

    async fn session(&mut self) -> SessionEnd {
        let token = match self.store.load(&self.collection).await {
            Ok(token) => token,
            Err(error) if error.is_fatal() => return SessionEnd::Fatal(error.to_string()),
            Err(error) => {
                return SessionEnd::Failed(SourceError::Other(format!(
                    "resume token load failed: {error}"
                )));
            }
        };

        let resumed = token.is_some();
        let options = WatchOptions::new().resume_after(token);
        let mut stream = match self.source.watch(options).await {
            Ok(stream) => stream,
            Err(SourceError::Invalidated) => return SessionEnd::Invalidated,
            Err(error) => return SessionEnd::Failed(error),
        };

        tracing::info!(collection = %self.collection, resumed, "Change stream opened");
        self.set_state(ListenerState::Streaming);

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) if event.is_invalidate() => return SessionEnd::Invalidated,
                Ok(event) => event,
                Err(SourceError::Invalidated) => return SessionEnd::Invalidated,
                Err(error) => return SessionEnd::Failed(error),
            };
            self.backoff.reset();

            match self.pool.submit(event) {
                Ok(Submitted::Queued(_) | Submitted::Dropped(_)) => {}
                Err(DispatchError::MissingKey) => {
                    self.metrics.record_handled();
                    tracing::error!(
                        collection = %self.collection,
                        "Skipping change event without document key"
                    );
                }
                Err(error @ DispatchError::WorkerClosed(_)) => {
                    return SessionEnd::Fatal(error.to_string());
                }
            }
        }

        SessionEnd::Failed(SourceError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::dispatch::WorkerPool;
    use crate::metrics::MetricsRegistry;
    use crate::step::BusinessStep;
    use changefeed_core::handler::Handler;
    use changefeed_testing::{
        InMemoryResumeTokenStore, RecordingHandler, ScriptedChangeSource, Session, fixtures,
    };

    struct Fixture {
        listener: Listener,
        pool: WorkerPool,
        state: watch::Receiver<ListenerState>,
        handler: RecordingHandler,
    }

    fn fixture(source: ScriptedChangeSource, retry: RetryPolicy) -> Fixture {
        let handler = RecordingHandler::new("orders");
        let metrics = MetricsRegistry::new().get_or_create("orders");
        let store: Arc<dyn ResumeTokenStore> = Arc::new(InMemoryResumeTokenStore::new());
        let step_handler: Arc<dyn Handler> = Arc::new(handler.clone());
        let pool = WorkerPool::spawn("orders", 2, None, Arc::clone(&metrics), |worker| {
            BusinessStep::new(
                worker,
                Arc::clone(&step_handler),
                Arc::clone(&store),
                Arc::clone(&metrics),
                0.1,
            )
        });
        let (tx, state) = watch::channel(ListenerState::Connecting);
        let listener = Listener::new(
            Arc::new(source),
            store,
            pool.sender().unwrap(),
            metrics,
            retry,
            Arc::new(tx),
        );
        Fixture {
            listener,
            pool,
            state,
            handler,
        }
    }

    #[test]
    fn state_names_and_finality() {
        let retrying = ListenerState::Retrying {
            attempt: 2,
            delay: Duration::from_millis(200),
        };
        assert_eq!(retrying.name(), "retrying");
        assert_eq!(retrying.to_string(), "retrying (attempt 2, delay 200ms)");
        assert!(!retrying.is_final());
        assert!(ListenerState::Stopped.is_final());
        assert!(
            ListenerState::Terminated {
                reason: "x".into()
            }
            .is_final()
        );
    }

    #[tokio::test]
    async fn streams_until_shutdown() {
        let source = ScriptedChangeSource::new(
            "orders",
            vec![Session::events(fixtures::sequence("A", 3))],
        );
        let f = fixture(source, RetryPolicy::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(f.listener.run(stop_rx));

        assert!(f.handler.wait_for(3, Duration::from_secs(5)).await);
        assert_eq!(*f.state.borrow(), ListenerState::Streaming);

        stop_tx.send_replace(true);
        assert_eq!(task.await.unwrap(), ListenerState::Stopped);
        assert_eq!(*f.state.borrow(), ListenerState::Stopped);
        drop(f.pool);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff_sleep() {
        let source = ScriptedChangeSource::new(
            "orders",
            vec![Session::fail(SourceError::ConnectTimeout("no primary".into()))],
        );
        let retry = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(3600))
            .build();
        let mut f = fixture(source, retry);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(f.listener.run(stop_rx));

        let retrying = f
            .state
            .wait_for(|s| matches!(s, ListenerState::Retrying { .. }))
            .await
            .unwrap()
            .clone();
        assert_eq!(
            retrying,
            ListenerState::Retrying {
                attempt: 1,
                delay: Duration::from_secs(3600)
            }
        );

        let started = tokio::time::Instant::now();
        stop_tx.send_replace(true);
        assert_eq!(task.await.unwrap(), ListenerState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn non_transient_failures_are_retried_until_the_cap() {
        let source = ScriptedChangeSource::new(
            "orders",
            vec![
                Session::fail(SourceError::Other("unauthorized".into())),
                Session::fail(SourceError::Other("unauthorized".into())),
            ],
        );
        let retry = RetryPolicy::builder()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(1))
            .build();
        let f = fixture(source, retry);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let state = f.listener.run(stop_rx).await;
        match state {
            ListenerState::Terminated { reason } => {
                assert!(reason.contains("gave up after 2 attempts"));
                assert!(reason.contains("unauthorized"));
            }
            other => panic!("unexpected state {other}"),
        }
    }
}
