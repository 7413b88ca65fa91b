//! Resume-token checkpoints.
//!
//! Progress through a collection's change feed is recorded per
//! `(collection, worker)`: each worker upserts the token of the last event it
//! handled successfully. On start, a listener resumes from the **earliest**
//! recorded token of its collection, so no event acknowledged by any worker is
//! skipped. Events past that point on other partitions are redelivered, which
//! handlers tolerate by being idempotent.
//!
//! ## Persisted Record
//!
//! ```text
//! { collectionName: "orders",
//!   worker:         "w2",
//!   resumeToken:    { _data: "8263..." },
//!   date:           Timestamp(1700000000, 4),
//!   updatedAt:      ISODate("2024-..."),
//!   appName:        "demoChangeStream" }
//! ```
//!
//! The uniqueness key is `(collectionName, worker)`. The token payload is never
//! interpreted, only round-tripped.
//!
//! A worker's record only moves forward: a save whose cluster time is older
//! than the stored `date` leaves the record untouched. Replays after a resume
//! from the earliest token therefore cannot drag other workers back.

use crate::event::{ClusterTime, ResumeToken, WorkerId};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Application name stamped on every resume record.
pub const APP_NAME: &str = "demoChangeStream";

/// Errors from a resume-token store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend read/write failed
    #[error("Resume token store error: {0}")]
    Backend(String),

    /// A record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored record is unreadable
    #[error("Corrupted resume record for collection {collection}: {reason}")]
    Corrupted {
        /// Collection the record belongs to
        collection: String,
        /// What was wrong with it
        reason: String,
    },
}

impl StoreError {
    /// Whether the error should stop the affected listener instead of retrying.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

/// One persisted checkpoint, as stored by the backing collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    /// Watched collection
    pub collection_name: String,
    /// Worker label (`w<index>`)
    pub worker: String,
    /// Opaque token envelope
    pub resume_token: ResumeToken,
    /// Cluster time of the acknowledged event
    pub date: bson::Timestamp,
    /// Wall time of the write
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    /// Writer application
    pub app_name: String,
}

impl ResumeRecord {
    /// Build the record a worker writes after a successful event.
    #[must_use]
    pub fn new(
        collection: &str,
        worker: WorkerId,
        token: ResumeToken,
        cluster_time: ClusterTime,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            collection_name: collection.to_string(),
            worker: worker.to_string(),
            resume_token: token,
            date: cluster_time.into(),
            updated_at,
            app_name: APP_NAME.to_string(),
        }
    }

    /// Cluster time recorded in `date`.
    #[must_use]
    pub fn cluster_time(&self) -> ClusterTime {
        self.date.into()
    }
}

/// Durable store of per-worker resume tokens.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn ResumeTokenStore>` by every worker of every collection.
pub trait ResumeTokenStore: Send + Sync {
    /// Upsert the checkpoint for `(collection, worker)`.
    ///
    /// Implementations must ignore a save whose `cluster_time` is older than
    /// the one already recorded for the pair. An equal cluster time
    /// overwrites.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the write fails.
    fn save<'a>(
        &'a self,
        collection: &'a str,
        worker: WorkerId,
        token: &'a ResumeToken,
        cluster_time: ClusterTime,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Load the token with the earliest cluster time recorded for `collection`.
    ///
    /// Returns `None` when the collection has no checkpoints yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the read fails and
    /// [`StoreError::Corrupted`] if the stored record cannot be decoded.
    fn load<'a>(
        &'a self,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResumeToken>, StoreError>> + Send + 'a>>;
}
