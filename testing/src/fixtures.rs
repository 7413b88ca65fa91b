//! Change-event fixtures.
//!
//! Tokens are derived from a sequence number (`tok-000041`) so tests can map a
//! stored token back to the event that produced it with [`sequence_of`].

use bson::{Bson, doc};
use changefeed_core::event::{ChangeEvent, ClusterTime, OperationType, ResumeToken};

/// Cluster time seconds used as the origin for generated events.
pub const BASE_SECONDS: u32 = 1_700_000_000;

/// Token for the `seq`-th event.
#[must_use]
pub fn token(seq: u32) -> ResumeToken {
    ResumeToken::new(format!("tok-{seq:06}"))
}

/// Sequence number encoded in a fixture token.
#[must_use]
pub fn sequence_of(token: &ResumeToken) -> Option<u32> {
    token.data().strip_prefix("tok-")?.parse().ok()
}

/// Insert event for `key` at sequence `seq`.
///
/// Cluster time is `(BASE_SECONDS, seq)`, so cluster times order like `seq`.
#[must_use]
pub fn insert(key: impl Into<Bson>, seq: u32) -> ChangeEvent {
    let key = key.into();
    ChangeEvent::new(OperationType::Insert)
        .with_document_key(doc! { "_id": key.clone() })
        .with_full_document(doc! { "_id": key, "seq": i64::from(seq) })
        .with_cluster_time(ClusterTime::new(BASE_SECONDS, seq))
        .with_resume_token(token(seq))
}

/// Same as [`insert`] but with an explicit cluster time.
#[must_use]
pub fn insert_at(key: impl Into<Bson>, seq: u32, cluster_time: ClusterTime) -> ChangeEvent {
    let mut event = insert(key, seq);
    event.cluster_time = Some(cluster_time);
    event
}

/// `count` inserts sharing one document key, sequenced from 1.
#[must_use]
pub fn sequence(key: &str, count: u32) -> Vec<ChangeEvent> {
    (1..=count).map(|seq| insert(key, seq)).collect()
}

/// One insert per key `0..count`, each key used once, sequenced from 1.
#[must_use]
pub fn distinct_keys(count: u32) -> Vec<ChangeEvent> {
    (0..count).map(|i| insert(i.to_string(), i + 1)).collect()
}

/// Invalidation marker.
#[must_use]
pub fn invalidate(seq: u32) -> ChangeEvent {
    ChangeEvent::new(OperationType::Invalidate)
        .with_cluster_time(ClusterTime::new(BASE_SECONDS, seq))
        .with_resume_token(token(seq))
}

/// Event with no document key.
#[must_use]
pub fn malformed(seq: u32) -> ChangeEvent {
    ChangeEvent::new(OperationType::Insert)
        .with_cluster_time(ClusterTime::new(BASE_SECONDS, seq))
        .with_resume_token(token(seq))
}
