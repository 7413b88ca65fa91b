//! Resume records in a MongoDB collection.
//!
//! One document per `(collectionName, worker)`:
//!
//! ```text
//! { collectionName: "orders",
//!   worker: "w2",
//!   resumeToken: { _data: "8265..." },
//!   date: Timestamp(1700000000, 3),
//!   updatedAt: ISODate("..."),
//!   appName: "demoChangeStream" }
//! ```
//!
//! Saves are a single upsert whose update pipeline only replaces the fields
//! when the stored `date` is missing or not newer than the incoming one.

use bson::{Document, doc};
use changefeed_core::checkpoint::{ResumeRecord, ResumeTokenStore, StoreError};
use changefeed_core::event::{ClusterTime, ResumeToken, WorkerId};
use chrono::Utc;
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use std::future::Future;
use std::pin::Pin;

/// [`ResumeTokenStore`] backed by a MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoResumeTokenStore {
    records: Collection<Document>,
}

impl MongoResumeTokenStore {
    /// Store records in `collection` of `db`.
    #[must_use]
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            records: db.collection(collection),
        }
    }

    /// Create the unique upsert-key index and the earliest-token index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if index creation fails.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique_key = IndexModel::builder()
            .keys(doc! { "collectionName": 1, "worker": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let by_date = IndexModel::builder()
            .keys(doc! { "collectionName": 1, "date": 1 })
            .build();

        self.records
            .create_indexes([unique_key, by_date])
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        tracing::debug!(collection = %self.records.name(), "Resume token indexes ensured");
        Ok(())
    }

    /// Every record of `collection`, for inspection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on driver failure and
    /// [`StoreError::Corrupted`] on an undecodable record.
    pub async fn records(&self, collection: &str) -> Result<Vec<ResumeRecord>, StoreError> {
        use futures::TryStreamExt;

        let documents: Vec<Document> = self
            .records
            .find(doc! { "collectionName": collection })
            .sort(doc! { "worker": 1 })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        documents
            .into_iter()
            .map(|document| decode(collection, document))
            .collect()
    }
}

/// Update pipeline writing `record` unless the stored record is newer.
fn forward_only_update(record: &ResumeRecord) -> Result<Vec<Document>, StoreError> {
    let fields = bson::to_document(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let advances = doc! {
        "$or": [
            { "$eq": [{ "$type": "$date" }, "missing"] },
            { "$lte": ["$date", { "$literal": record.date }] },
        ]
    };

    let mut set = Document::new();
    for (name, value) in fields {
        let current = format!("${name}");
        set.insert(
            name,
            doc! { "$cond": [advances.clone(), { "$literal": value }, current] },
        );
    }
    Ok(vec![doc! { "$set": set }])
}

fn decode(collection: &str, document: Document) -> Result<ResumeRecord, StoreError> {
    bson::from_document(document).map_err(|e| StoreError::Corrupted {
        collection: collection.to_string(),
        reason: e.to_string(),
    })
}

impl ResumeTokenStore for MongoResumeTokenStore {
    fn save<'a>(
        &'a self,
        collection: &'a str,
        worker: WorkerId,
        token: &'a ResumeToken,
        cluster_time: ClusterTime,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let record = ResumeRecord::new(collection, worker, token.clone(), cluster_time, Utc::now());

            self.records
                .update_one(
                    doc! { "collectionName": collection, "worker": worker.to_string() },
                    forward_only_update(&record)?,
                )
                .upsert(true)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResumeToken>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let earliest = self
                .records
                .find_one(doc! { "collectionName": collection })
                .sort(doc! { "date": 1, "worker": 1 })
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let Some(document) = earliest else {
                tracing::info!(collection, "No resume token stored, starting at the tail");
                return Ok(None);
            };
            let record = decode(collection, document)?;
            tracing::info!(
                collection,
                worker = %record.worker,
                cluster_time = %record.cluster_time(),
                "Resuming from earliest stored token"
            );
            Ok(Some(record.resume_token))
        })
    }
}
