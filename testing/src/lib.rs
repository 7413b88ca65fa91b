//! # Changefeed Testing
//!
//! Test doubles for the change-feed consumer.
//!
//! This crate provides:
//! - [`InMemoryResumeTokenStore`]: `HashMap`-backed checkpoint store with fault injection
//! - [`ScriptedChangeSource`]: a source whose successive `watch` calls follow a script
//! - [`ReplayChangeSource`]: a source over an append-only log that honours `resume_after`
//! - [`RecordingHandler`]: records every event it is handed, can fail or panic on demand
//! - [`fixtures`]: small constructors for change events
//!
//! ## Example
//!
//! ```ignore
//! use changefeed_testing::{fixtures, InMemoryResumeTokenStore, RecordingHandler, ScriptedChangeSource, Session};
//!
//! let store = Arc::new(InMemoryResumeTokenStore::new());
//! let handler = Arc::new(RecordingHandler::new("orders"));
//! let source = Arc::new(ScriptedChangeSource::new("orders", vec![
//!     Session::fail(SourceError::SocketRead("reset".into())),
//!     Session::events(fixtures::sequence("A", 10)),
//! ]));
//!
//! let mut mediator = Mediator::builder(config)
//!     .store(store.clone())
//!     .bind(handler.clone(), source.clone())
//!     .build()?;
//! mediator.start()?;
//! assert!(handler.wait_for(10, Duration::from_secs(5)).await);
//! ```

pub mod fixtures;
pub mod handler;
pub mod source;
pub mod store;

pub use handler::RecordingHandler;
pub use source::{ReplayChangeSource, ScriptedChangeSource, Session, WatchCall};
pub use store::InMemoryResumeTokenStore;
