//! Recording handler.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only
#![allow(clippy::panic)] // Panicking on demand is the point

use changefeed_core::event::ChangeEvent;
use changefeed_core::handler::{Handler, HandlerError, HandlerStatus};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Status code returned for keys registered with [`RecordingHandler::failing_on`].
pub const FAILURE_STATUS: i32 = -1;

/// Handler that records every event in invocation order.
///
/// Keys can be configured to return a failure status, to return an error, or
/// to panic. An optional delay simulates slow downstream writes.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    collection: String,
    received: Arc<Mutex<Vec<ChangeEvent>>>,
    progress: Arc<Notify>,
    failing: HashSet<String>,
    erroring: HashSet<String>,
    panicking: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    /// Create a handler bound to `collection` that succeeds on everything.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            received: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::new(Notify::new()),
            failing: HashSet::new(),
            erroring: HashSet::new(),
            panicking: HashSet::new(),
            delay: None,
        }
    }

    /// Return [`FAILURE_STATUS`] for events with this dispatch key.
    #[must_use]
    pub fn failing_on(mut self, key: impl Into<String>) -> Self {
        self.failing.insert(key.into());
        self
    }

    /// Return a [`HandlerError`] for events with this dispatch key.
    #[must_use]
    pub fn erroring_on(mut self, key: impl Into<String>) -> Self {
        self.erroring.insert(key.into());
        self
    }

    /// Panic for events with this dispatch key.
    #[must_use]
    pub fn panicking_on(mut self, key: impl Into<String>) -> Self {
        self.panicking.insert(key.into());
        self
    }

    /// Sleep this long before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Events received so far, in invocation order.
    #[must_use]
    pub fn received(&self) -> Vec<ChangeEvent> {
        self.received.lock().unwrap().clone()
    }

    /// Dispatch keys received so far, in invocation order.
    #[must_use]
    pub fn received_keys(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(ChangeEvent::dispatch_key)
            .collect()
    }

    /// Number of events received so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Wait until at least `count` events were received or `timeout` elapses.
    ///
    /// Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let reached = async {
            loop {
                let notified = self.progress.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }
}

impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn process<'a>(
        &'a self,
        event: &'a ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerStatus, HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.received.lock().unwrap().push(event.clone());
            self.progress.notify_waiters();

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let key = event.dispatch_key().unwrap_or_default();
            if self.panicking.contains(&key) {
                panic!("handler panic for key {key}");
            }
            if self.erroring.contains(&key) {
                return Err(HandlerError::Storage(format!("write failed for {key}")));
            }
            if self.failing.contains(&key) {
                return Ok(HandlerStatus::code(FAILURE_STATUS));
            }
            Ok(HandlerStatus::SUCCESS)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn records_in_order_and_fails_on_demand() {
        let handler = RecordingHandler::new("orders")
            .failing_on("bad")
            .erroring_on("worse");

        let ok = handler.process(&fixtures::insert("A", 1)).await.unwrap();
        let failed = handler.process(&fixtures::insert("bad", 2)).await.unwrap();
        let errored = handler.process(&fixtures::insert("worse", 3)).await;

        assert!(ok.is_success());
        assert_eq!(failed.as_i32(), FAILURE_STATUS);
        assert!(errored.is_err());
        assert_eq!(handler.received_keys(), vec!["A", "bad", "worse"]);
    }

    #[tokio::test]
    async fn wait_for_sees_progress_from_clones() {
        let handler = RecordingHandler::new("orders");
        let clone = handler.clone();
        tokio::spawn(async move {
            for seq in 1..=3 {
                let _ = clone.process(&fixtures::insert("A", seq)).await;
            }
        });

        assert!(handler.wait_for(3, Duration::from_secs(5)).await);
        assert!(!handler.wait_for(10, Duration::from_millis(20)).await);
    }
}
