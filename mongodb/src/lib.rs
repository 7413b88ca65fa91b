//! MongoDB adapters for the change-feed consumer.
//!
//! This crate implements the two storage-facing contracts of
//! `changefeed-core` on top of the official `mongodb` driver:
//!
//! - [`MongoChangeSource`]: a collection change stream honouring
//!   `resumeAfter`, with `updateLookup` post-images and `whenAvailable`
//!   pre-images by default
//! - [`MongoResumeTokenStore`]: resume records upserted per
//!   `(collectionName, worker)` and read back earliest-first
//!
//! Change streams require a replica set or sharded cluster.
//!
//! # Example
//!
//! ```ignore
//! use changefeed_mongodb::{MongoChangeSource, MongoResumeTokenStore, connect};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = connect("mongodb://localhost:27017/?replicaSet=rs0", "demo").await?;
//!     let store = MongoResumeTokenStore::new(&db, "resumeTokens");
//!     store.ensure_indexes().await?;
//!     let orders = MongoChangeSource::new(db.collection("orders"));
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod source;
mod store;

pub use error::source_error;
pub use source::{MongoChangeSource, to_change_event};
pub use store::MongoResumeTokenStore;

use bson::doc;
use changefeed_core::SourceError;
use mongodb::{Client, Database};

/// Connect to `uri`, check the deployment answers, and return `database`.
///
/// # Errors
///
/// Returns a [`SourceError`] if the URI is invalid or no server responds.
pub async fn connect(uri: &str, database: &str) -> Result<Database, SourceError> {
    let client = Client::with_uri_str(uri).await.map_err(|e| source_error(&e))?;
    let db = client.database(database);
    db.run_command(doc! { "ping": 1 })
        .await
        .map_err(|e| source_error(&e))?;
    tracing::info!(database, "Connected to MongoDB");
    Ok(db)
}
