//! Change sources for tests.
//!
//! - [`ScriptedChangeSource`] plays one [`Session`] per `watch` call, which makes
//!   fault bursts and invalidations easy to stage.
//! - [`ReplayChangeSource`] serves an append-only log and honours
//!   `resume_after`, which is what restart scenarios need.
//!
//! Both record every `watch` call with the options it received and the
//! (tokio) instant it happened, so paused-clock tests can assert backoff delays.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use changefeed_core::event::ChangeEvent;
use changefeed_core::source::{ChangeSource, ChangeStream, SourceError, WatchOptions};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Server code reported when a resume token is no longer in the feed history.
pub const HISTORY_LOST_CODE: i32 = 286;

/// One recorded `watch` call.
#[derive(Debug, Clone)]
pub struct WatchCall {
    /// Options the caller passed
    pub options: WatchOptions,
    /// When the call happened
    pub at: Instant,
}

/// What one `watch` call of a [`ScriptedChangeSource`] does.
#[derive(Debug, Clone)]
pub enum Session {
    /// `watch` itself fails
    Fail(SourceError),
    /// `watch` opens a cursor yielding these items
    Open {
        /// Items yielded in order
        items: Vec<Result<ChangeEvent, SourceError>>,
        /// End the stream after the items instead of idling
        end: bool,
    },
}

impl Session {
    /// Opening the cursor fails.
    #[must_use]
    pub const fn fail(error: SourceError) -> Self {
        Self::Fail(error)
    }

    /// Cursor yields `events` and then idles at the tail.
    #[must_use]
    pub fn events(events: Vec<ChangeEvent>) -> Self {
        Self::Open {
            items: events.into_iter().map(Ok).collect(),
            end: false,
        }
    }

    /// Cursor yields `events` and then reports `error`.
    #[must_use]
    pub fn events_then_error(events: Vec<ChangeEvent>, error: SourceError) -> Self {
        let mut items: Vec<_> = events.into_iter().map(Ok).collect();
        items.push(Err(error));
        Self::Open { items, end: false }
    }

    /// Cursor yields `events` and then ends.
    #[must_use]
    pub fn events_then_end(events: Vec<ChangeEvent>) -> Self {
        Self::Open {
            items: events.into_iter().map(Ok).collect(),
            end: true,
        }
    }
}

fn scripted_stream(items: Vec<Result<ChangeEvent, SourceError>>, end: bool) -> ChangeStream {
    Box::pin(async_stream::stream! {
        for item in items {
            yield item;
        }
        if !end {
            futures::future::pending::<()>().await;
        }
    })
}

/// Source whose successive `watch` calls follow a script.
///
/// Once the script is exhausted, further cursors open successfully and idle.
#[derive(Debug, Clone)]
pub struct ScriptedChangeSource {
    collection: String,
    sessions: Arc<Mutex<VecDeque<Session>>>,
    calls: Arc<RwLock<Vec<WatchCall>>>,
}

impl ScriptedChangeSource {
    /// Create a source for `collection` that plays `sessions` in order.
    #[must_use]
    pub fn new(collection: impl Into<String>, sessions: Vec<Session>) -> Self {
        Self {
            collection: collection.into(),
            sessions: Arc::new(Mutex::new(sessions.into())),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append a session to the script.
    pub fn push(&self, session: Session) {
        self.sessions.lock().unwrap().push_back(session);
    }

    /// Every `watch` call so far.
    #[must_use]
    pub fn watch_calls(&self) -> Vec<WatchCall> {
        self.calls.read().unwrap().clone()
    }

    /// Number of `watch` calls so far.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

impl ChangeSource for ScriptedChangeSource {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn watch(
        &self,
        options: WatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            self.calls.write().unwrap().push(WatchCall {
                options,
                at: Instant::now(),
            });
            let session = self.sessions.lock().unwrap().pop_front();
            match session {
                Some(Session::Fail(error)) => Err(error),
                Some(Session::Open { items, end }) => Ok(scripted_stream(items, end)),
                None => Ok(scripted_stream(Vec::new(), false)),
            }
        })
    }
}

/// Source over an append-only change log.
///
/// A cursor opened without a token starts at the beginning of the log; with a
/// token it starts right after the event carrying that token. A token that is
/// not in the log yields a history-lost command failure. Cursors follow the
/// log live, so events pushed after `watch` are delivered too.
#[derive(Debug, Clone)]
pub struct ReplayChangeSource {
    collection: String,
    log: Arc<RwLock<Vec<ChangeEvent>>>,
    appended: Arc<Notify>,
    calls: Arc<RwLock<Vec<WatchCall>>>,
}

impl ReplayChangeSource {
    /// Create a source for `collection` with an initial log.
    #[must_use]
    pub fn new(collection: impl Into<String>, log: Vec<ChangeEvent>) -> Self {
        Self {
            collection: collection.into(),
            log: Arc::new(RwLock::new(log)),
            appended: Arc::new(Notify::new()),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append an event; open cursors deliver it.
    pub fn append(&self, event: ChangeEvent) {
        self.log.write().unwrap().push(event);
        self.appended.notify_waiters();
    }

    /// Every `watch` call so far.
    #[must_use]
    pub fn watch_calls(&self) -> Vec<WatchCall> {
        self.calls.read().unwrap().clone()
    }
}

impl ChangeSource for ReplayChangeSource {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn watch(
        &self,
        options: WatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let start = match &options.resume_after {
                None => 0,
                Some(token) => {
                    let log = self.log.read().unwrap();
                    let position = log
                        .iter()
                        .position(|e| e.resume_token.as_ref() == Some(token));
                    match position {
                        Some(index) => index + 1,
                        None => {
                            return Err(SourceError::CommandFailure {
                                code: HISTORY_LOST_CODE,
                                message: format!("resume point {} not found", token.data()),
                            });
                        }
                    }
                }
            };
            self.calls.write().unwrap().push(WatchCall {
                options,
                at: Instant::now(),
            });

            let log = Arc::clone(&self.log);
            let appended = Arc::clone(&self.appended);
            let stream: ChangeStream = Box::pin(async_stream::stream! {
                let mut next = start;
                loop {
                    let notified = appended.notified();
                    let event = log.read().unwrap().get(next).cloned();
                    match event {
                        Some(event) => {
                            next += 1;
                            yield Ok(event);
                        }
                        None => notified.await,
                    }
                }
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_sessions_play_in_order() {
        let source = ScriptedChangeSource::new(
            "orders",
            vec![
                Session::fail(SourceError::SocketRead("reset".into())),
                Session::events_then_end(fixtures::sequence("A", 2)),
            ],
        );

        assert!(source.watch(WatchOptions::new()).await.is_err());

        let stream = source.watch(WatchOptions::new()).await.unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(source.watch_count(), 2);
    }

    #[tokio::test]
    async fn replay_resumes_after_token() {
        let source = ReplayChangeSource::new("orders", fixtures::sequence("A", 5));
        let options = WatchOptions::new().resume_after(Some(fixtures::token(3)));

        let mut stream = source.watch(options).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(fixtures::sequence_of(first.resume_token.as_ref().unwrap()), Some(4));

        let _ = stream.next().await;
        source.append(fixtures::insert("A", 6));
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(fixtures::sequence_of(live.resume_token.as_ref().unwrap()), Some(6));
    }

    #[tokio::test]
    async fn replay_reports_lost_history() {
        let source = ReplayChangeSource::new("orders", fixtures::sequence("A", 2));
        let options = WatchOptions::new().resume_after(Some(fixtures::token(99)));

        let result = source.watch(options).await;
        assert!(matches!(
            result,
            Err(SourceError::CommandFailure { code: HISTORY_LOST_CODE, .. })
        ));
    }
}
