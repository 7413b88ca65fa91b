//! Change-feed cursors.
//!
//! A [`ChangeSource`] opens a cursor over one collection's change feed and
//! returns it as a [`ChangeStream`]. Faults are reported through the stream (or
//! from `watch` itself) as [`SourceError`]s, which the listener classifies to
//! decide between retrying with backoff, reopening immediately, or stopping.

use crate::event::{ChangeEvent, ResumeToken};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Errors raised while opening or reading a change feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Connection or server selection timed out
    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    /// Reading from the socket failed
    #[error("Socket read failed: {0}")]
    SocketRead(String),

    /// Writing to the socket failed
    #[error("Socket write failed: {0}")]
    SocketWrite(String),

    /// The server rejected a command (not primary, interrupted, ...)
    #[error("Command failed ({code}): {message}")]
    CommandFailure {
        /// Server error code
        code: i32,
        /// Server error message
        message: String,
    },

    /// A write concern could not be satisfied
    #[error("Write concern failed: {0}")]
    WriteConcernFailure(String),

    /// The cursor was invalidated and must be reopened
    #[error("Change stream invalidated")]
    Invalidated,

    /// The cursor ended without an error
    #[error("Change stream ended")]
    Exhausted,

    /// Anything unclassified
    #[error("Change source error: {0}")]
    Other(String),
}

impl SourceError {
    /// Whether this is one of the known transient network/replica faults.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::SocketRead(_)
                | Self::SocketWrite(_)
                | Self::CommandFailure { .. }
                | Self::WriteConcernFailure(_)
                | Self::Exhausted
        )
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::SocketRead(_) => "socket_read",
            Self::SocketWrite(_) => "socket_write",
            Self::CommandFailure { .. } => "command_failure",
            Self::WriteConcernFailure(_) => "write_concern_failure",
            Self::Invalidated => "invalidated",
            Self::Exhausted => "exhausted",
            Self::Other(_) => "other",
        }
    }
}

/// Stream of change events from an open cursor.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, SourceError>> + Send>>;

/// Post-image behaviour for update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullDocumentMode {
    /// Source default (no post-image for updates)
    Default,
    /// Look up the current document for updates
    #[default]
    UpdateLookup,
    /// Include the post-image if the collection records one
    WhenAvailable,
    /// Fail if the post-image is unavailable
    Required,
}

/// Pre-image behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullDocumentBeforeChange {
    /// Never include the pre-image
    Off,
    /// Include the pre-image if the collection records one
    #[default]
    WhenAvailable,
    /// Fail if the pre-image is unavailable
    Required,
}

/// Options for opening a cursor.
///
/// Defaults request `updateLookup` post-images and `whenAvailable` pre-images
/// and start from the current tail.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchOptions {
    /// Resume after this token instead of the current tail
    pub resume_after: Option<ResumeToken>,
    /// Post-image behaviour
    pub full_document: FullDocumentMode,
    /// Pre-image behaviour
    pub full_document_before_change: FullDocumentBeforeChange,
}

impl WatchOptions {
    /// Options with the defaults described above.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after the given token, if any.
    #[must_use]
    pub fn resume_after(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_after = token;
        self
    }
}

/// Factory for change-feed cursors over one collection.
///
/// # Dyn Compatibility
///
/// `watch` returns an explicit `Pin<Box<dyn Future>>` so sources can be held as
/// `Arc<dyn ChangeSource>` by listeners.
pub trait ChangeSource: Send + Sync {
    /// The watched collection.
    fn collection(&self) -> &str;

    /// Open a cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the cursor cannot be opened.
    fn watch(
        &self,
        options: WatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, SourceError>> + Send + '_>>;
}
