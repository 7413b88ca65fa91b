//! Per-collection business handlers.
//!
//! A [`Handler`] is the only piece of business logic the consumer runs. It is
//! bound to one watched collection when it is constructed (it receives whatever
//! collection handles it needs at that point) and is then invoked once per
//! change event by the worker that owns the event's partition.
//!
//! Everything else about an event's lifecycle (throughput accounting, lag and
//! latency metrics, resume-token persistence) happens around the handler, not
//! inside it.
//!
//! # Idempotence
//!
//! Resuming from the earliest checkpoint of a collection redelivers events that
//! other workers already acknowledged. Handlers must therefore be idempotent over
//! `(document_key, cluster_time)`.
//!
//! # Example
//!
//! ```
//! use changefeed_core::event::ChangeEvent;
//! use changefeed_core::handler::{Handler, HandlerError, HandlerStatus};
//! use std::future::Future;
//! use std::pin::Pin;
//!
//! struct AuditHandler;
//!
//! impl Handler for AuditHandler {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     fn collection(&self) -> &str {
//!         "orders"
//!     }
//!
//!     fn process<'a>(
//!         &'a self,
//!         event: &'a ChangeEvent,
//!     ) -> Pin<Box<dyn Future<Output = Result<HandlerStatus, HandlerError>> + Send + 'a>> {
//!         Box::pin(async move {
//!             if event.full_document.is_none() {
//!                 return Ok(HandlerStatus::code(-1));
//!             }
//!             Ok(HandlerStatus::SUCCESS)
//!         })
//!     }
//! }
//! ```

use crate::event::ChangeEvent;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Integer outcome of handling one event. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerStatus(i32);

impl HandlerStatus {
    /// The event was handled.
    pub const SUCCESS: Self = Self(0);

    /// Wrap a raw status code.
    #[must_use]
    pub const fn code(code: i32) -> Self {
        Self(code)
    }

    /// Raw status code.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether the code denotes success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<i32> for HandlerStatus {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for HandlerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure raised while handling an event.
///
/// Treated exactly like a non-zero [`HandlerStatus`]: the event counts as
/// handled but not successful, and its resume token is not persisted.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Downstream write failed
    #[error("Downstream storage error: {0}")]
    Storage(String),

    /// The event lacks data the handler requires
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Anything else
    #[error("Handler error: {0}")]
    Other(String),
}

/// Capability set for a collection's business processor.
///
/// # Dyn Compatibility
///
/// `process` returns an explicit `Pin<Box<dyn Future>>` so handlers can be
/// shared as `Arc<dyn Handler>` between the worker tasks of a pool.
pub trait Handler: Send + Sync {
    /// Human-readable handler name, used in logs.
    fn name(&self) -> &str;

    /// Name of the collection this handler is bound to.
    fn collection(&self) -> &str;

    /// Handle one change event.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when processing fails outright. A handler may
    /// instead return a non-zero [`HandlerStatus`]; both are treated as failure.
    fn process<'a>(
        &'a self,
        event: &'a ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerStatus, HandlerError>> + Send + 'a>>;
}
