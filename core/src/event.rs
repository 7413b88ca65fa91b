//! Change events and the small value types they carry.
//!
//! A [`ChangeEvent`] is one mutation reported by the source's change feed. It is
//! produced by a [`ChangeSource`](crate::source::ChangeSource), consumed exactly
//! once by one worker, and carries everything the per-event lifecycle needs:
//!
//! - the operation type (`insert`, `update`, `replace`, `delete`, `invalidate`, ...)
//! - the document key, which decides the worker partition
//! - the full document (post-image) and, when available, the pre-image
//! - the cluster time, used for lag and for ordering resume records
//! - the opaque resume token, persisted after successful handling
//!
//! # Example
//!
//! ```
//! use bson::doc;
//! use changefeed_core::event::{ChangeEvent, ClusterTime, OperationType, ResumeToken};
//!
//! let event = ChangeEvent::new(OperationType::Insert)
//!     .with_document_key(doc! { "_id": 42 })
//!     .with_full_document(doc! { "_id": 42, "value": 10.5 })
//!     .with_cluster_time(ClusterTime::new(1_700_000_000, 1))
//!     .with_resume_token(ResumeToken::new("8263A1"));
//!
//! assert_eq!(event.dispatch_key().as_deref(), Some("42"));
//! assert!(!event.is_invalidate());
//! ```

use bson::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// A document was inserted
    Insert,
    /// A document was partially updated
    Update,
    /// A document was replaced wholesale
    Replace,
    /// A document was deleted
    Delete,
    /// The cursor position is no longer valid; the consumer must reopen
    Invalidate,
    /// Any other feed operation (`drop`, `rename`, `dropDatabase`, ...)
    Other(String),
}

impl OperationType {
    /// Whether this is the feed's invalidation marker.
    #[must_use]
    pub const fn is_invalidate(&self) -> bool {
        matches!(self, Self::Invalidate)
    }

    /// Wire name as reported by the source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for OperationType {
    fn from(value: &str) -> Self {
        match value {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "replace" => Self::Replace,
            "delete" => Self::Delete,
            "invalidate" => Self::Invalidate,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-assigned logical timestamp of a change.
///
/// Ordered by `(seconds, increment)`, which is the order the source assigns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterTime {
    /// Seconds since the Unix epoch
    pub seconds: u32,
    /// Ordinal among changes within the same second
    pub increment: u32,
}

impl ClusterTime {
    /// Create a cluster time from its two components.
    #[must_use]
    pub const fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// Cluster time at seconds precision, expressed in milliseconds.
    #[must_use]
    pub fn as_millis(self) -> i64 {
        i64::from(self.seconds) * 1000
    }
}

impl From<bson::Timestamp> for ClusterTime {
    fn from(ts: bson::Timestamp) -> Self {
        Self::new(ts.time, ts.increment)
    }
}

impl From<ClusterTime> for bson::Timestamp {
    fn from(ct: ClusterTime) -> Self {
        Self {
            time: ct.seconds,
            increment: ct.increment,
        }
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seconds, self.increment)
    }
}

/// Opaque, source-assigned cursor position.
///
/// Serializes as `{ "_data": "<opaque>" }`. Nothing in this system interprets
/// the payload; it is only stored and handed back to the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    #[serde(rename = "_data")]
    data: String,
}

impl ResumeToken {
    /// Wrap an opaque token payload.
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    /// The opaque payload.
    #[must_use]
    pub fn data(&self) -> &str {
        &self.data
    }
}

/// Index of a logical worker within one collection's pool.
///
/// Rendered as `w<index>` in metric labels and resume records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// Zero-based index within the pool.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('w').unwrap_or(s).parse().map(Self)
    }
}

/// One mutation read from a collection's change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened
    pub operation: OperationType,
    /// Identifier of the mutated document (`{ _id: ... }`)
    pub document_key: Option<Document>,
    /// Post-image (looked up for updates)
    pub full_document: Option<Document>,
    /// Pre-image, when the collection records one
    pub full_document_before_change: Option<Document>,
    /// Logical time the change was committed
    pub cluster_time: Option<ClusterTime>,
    /// Position to resume after this event
    pub resume_token: Option<ResumeToken>,
}

impl ChangeEvent {
    /// Create an event with only its operation type set.
    #[must_use]
    pub const fn new(operation: OperationType) -> Self {
        Self {
            operation,
            document_key: None,
            full_document: None,
            full_document_before_change: None,
            cluster_time: None,
            resume_token: None,
        }
    }

    /// Set the document key.
    #[must_use]
    pub fn with_document_key(mut self, key: Document) -> Self {
        self.document_key = Some(key);
        self
    }

    /// Set the post-image.
    #[must_use]
    pub fn with_full_document(mut self, document: Document) -> Self {
        self.full_document = Some(document);
        self
    }

    /// Set the pre-image.
    #[must_use]
    pub fn with_full_document_before_change(mut self, document: Document) -> Self {
        self.full_document_before_change = Some(document);
        self
    }

    /// Set the cluster time.
    #[must_use]
    pub const fn with_cluster_time(mut self, cluster_time: ClusterTime) -> Self {
        self.cluster_time = Some(cluster_time);
        self
    }

    /// Set the resume token.
    #[must_use]
    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    /// Whether this event is the feed's invalidation marker.
    #[must_use]
    pub const fn is_invalidate(&self) -> bool {
        self.operation.is_invalidate()
    }

    /// String form of the document key used for partitioning.
    ///
    /// Uses the `_id` value when present, otherwise the whole key document.
    /// Returns `None` when the event carries no (or an empty) document key,
    /// which makes it malformed for dispatch purposes.
    #[must_use]
    pub fn dispatch_key(&self) -> Option<String> {
        let key = self.document_key.as_ref().filter(|k| !k.is_empty())?;
        Some(match key.get("_id") {
            Some(bson::Bson::String(s)) => s.clone(),
            Some(id) => id.to_string(),
            None => key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use bson::doc;

    #[test]
    fn cluster_time_orders_by_seconds_then_increment() {
        let a = ClusterTime::new(100, 5);
        let b = ClusterTime::new(100, 6);
        let c = ClusterTime::new(101, 0);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.as_millis(), 101_000);
    }

    #[test]
    fn cluster_time_converts_to_and_from_bson() {
        let ts = bson::Timestamp {
            time: 1_700_000_000,
            increment: 3,
        };
        let ct = ClusterTime::from(ts);
        assert_eq!(ct, ClusterTime::new(1_700_000_000, 3));
        assert_eq!(bson::Timestamp::from(ct), ts);
    }

    #[test]
    fn resume_token_serializes_as_data_envelope() {
        let token = ResumeToken::new("82646F");
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json, serde_json::json!({ "_data": "82646F" }));

        let back: ResumeToken = serde_json::from_value(json).unwrap();
        assert_eq!(back.data(), "82646F");
    }

    #[test]
    fn worker_id_label_round_trips() {
        let worker = WorkerId(2);
        assert_eq!(worker.to_string(), "w2");
        assert_eq!("w2".parse::<WorkerId>().unwrap(), worker);
        assert_eq!("7".parse::<WorkerId>().unwrap(), WorkerId(7));
        assert!("wx".parse::<WorkerId>().is_err());
    }

    #[test]
    fn operation_type_parses_wire_names() {
        assert_eq!(OperationType::from("insert"), OperationType::Insert);
        assert_eq!(OperationType::from("invalidate"), OperationType::Invalidate);
        assert_eq!(
            OperationType::from("dropDatabase"),
            OperationType::Other("dropDatabase".to_string())
        );
        assert_eq!(OperationType::Other("drop".into()).as_str(), "drop");
    }

    #[test]
    fn dispatch_key_prefers_id_value() {
        let by_string = ChangeEvent::new(OperationType::Update)
            .with_document_key(doc! { "_id": "A" });
        assert_eq!(by_string.dispatch_key().as_deref(), Some("A"));

        let by_int = ChangeEvent::new(OperationType::Update)
            .with_document_key(doc! { "_id": 7_i32 });
        assert_eq!(by_int.dispatch_key().as_deref(), Some("7"));

        let compound = ChangeEvent::new(OperationType::Delete)
            .with_document_key(doc! { "shard": 1_i32, "sku": "x" });
        assert!(compound.dispatch_key().unwrap().contains("sku"));
    }

    #[test]
    fn dispatch_key_missing_for_malformed_events() {
        assert!(ChangeEvent::new(OperationType::Insert).dispatch_key().is_none());

        let empty = ChangeEvent::new(OperationType::Insert).with_document_key(doc! {});
        assert!(empty.dispatch_key().is_none());
    }
}
