//! # Changefeed Core
//!
//! Core types and contracts for a resumable, at-least-once change-feed consumer.
//!
//! This crate has no runtime of its own. It defines what flows through the
//! system and the seams where collaborators plug in:
//!
//! - [`event`]: change events as read from a document store's change feed
//! - [`handler`]: the per-collection business handler capability set
//! - [`checkpoint`]: the resume-token store contract and its persisted record
//! - [`source`]: the change-feed cursor contract and its error taxonomy
//!
//! ## Data Flow
//!
//! ```text
//! ChangeSource ─watch()─► ChangeStream ─► listener ─hash(key) mod N─► worker
//!                                                                      │
//!                                          Handler::process ◄──────────┤
//!                                          ResumeTokenStore::save ◄────┘
//! ```
//!
//! ## Delivery Semantics
//!
//! - **At-least-once**: on restart the feed resumes from the earliest token any
//!   worker acknowledged, so some events are redelivered
//! - **Per-key order**: events sharing a document key reach the handler in
//!   cursor order
//! - **Idempotent handlers**: a precondition, not something this crate enforces

pub use chrono::{DateTime, Utc};

pub mod checkpoint;
pub mod event;
pub mod handler;
pub mod source;

pub use checkpoint::{ResumeRecord, ResumeTokenStore, StoreError};
pub use event::{ChangeEvent, ClusterTime, OperationType, ResumeToken, WorkerId};
pub use handler::{Handler, HandlerError, HandlerStatus};
pub use source::{
    ChangeSource, ChangeStream, FullDocumentBeforeChange, FullDocumentMode, SourceError,
    WatchOptions,
};
