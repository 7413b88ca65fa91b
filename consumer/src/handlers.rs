//! Business handlers bound to watched collections.
//!
//! - [`DailyTransactionHandler`] folds player transactions into one rollup
//!   document per `(playerID, gamingDate)` in [`DAILY_ROLLUP_COLLECTION`]
//! - [`LoggingHandler`] logs every change and succeeds; it is the fallback for
//!   any collection without a dedicated handler

use bson::{Bson, DateTime, Document, doc};
use changefeed_core::event::{ChangeEvent, OperationType};
use changefeed_core::handler::{Handler, HandlerError, HandlerStatus};
use mongodb::{Collection, Database};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Collection of raw player transactions.
pub const TRANSACTIONS_COLLECTION: &str = "changestream";

/// Collection receiving the per-day rollups.
pub const DAILY_ROLLUP_COLLECTION: &str = "userdailytxn";

/// Status returned for a transaction document that cannot be folded.
pub const INVALID_DOCUMENT: HandlerStatus = HandlerStatus::code(-1);

const REQUIRED_FIELDS: [&str; 5] = ["playerID", "transactionID", "value", "name", "date"];
const MILLIS_PER_DAY: i64 = 86_400_000;

/// Pick the handler for `collection`.
#[must_use]
pub fn handler_for(db: &Database, collection: &str) -> Arc<dyn Handler> {
    match collection {
        TRANSACTIONS_COLLECTION => Arc::new(DailyTransactionHandler::new(
            collection,
            db.collection(DAILY_ROLLUP_COLLECTION),
        )),
        _ => Arc::new(LoggingHandler::new(collection)),
    }
}

/// Logs each change and reports success.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    collection: String,
}

impl LoggingHandler {
    /// Log changes of `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

impl Handler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn process<'a>(
        &'a self,
        event: &'a ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerStatus, HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                collection = %self.collection,
                operation = %event.operation,
                key = event.dispatch_key().as_deref().unwrap_or("-"),
                cluster_time = ?event.cluster_time,
                "Change received"
            );
            Ok(HandlerStatus::SUCCESS)
        })
    }
}

/// One player transaction read from a post-image.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    player_id: Bson,
    transaction_id: Bson,
    value: Bson,
    name: String,
    date: DateTime,
}

fn field<'d>(document: &'d Document, name: &str) -> Result<&'d Bson, HandlerError> {
    match document.get(name) {
        None | Some(Bson::Null) => Err(HandlerError::InvalidDocument(format!(
            "missing required field {name}"
        ))),
        Some(value) => Ok(value),
    }
}

impl Transaction {
    /// Read a transaction from its document.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidDocument`] if a required field is
    /// missing, `name` is not a string or `date` is not a datetime.
    pub fn from_document(document: &Document) -> Result<Self, HandlerError> {
        for name in REQUIRED_FIELDS {
            field(document, name)?;
        }
        let invalid = |e: bson::document::ValueAccessError| HandlerError::InvalidDocument(e.to_string());

        Ok(Self {
            player_id: field(document, "playerID")?.clone(),
            transaction_id: field(document, "transactionID")?.clone(),
            value: field(document, "value")?.clone(),
            name: document.get_str("name").map_err(invalid)?.to_string(),
            date: *document.get_datetime("date").map_err(invalid)?,
        })
    }

    /// The transaction date truncated to midnight UTC.
    #[must_use]
    pub fn gaming_date(&self) -> DateTime {
        let millis = self.date.timestamp_millis();
        DateTime::from_millis(millis - millis.rem_euclid(MILLIS_PER_DAY))
    }

    /// Rollup document this transaction folds into.
    #[must_use]
    pub fn rollup_filter(&self) -> Document {
        doc! {
            "playerID": self.player_id.clone(),
            "gamingDate": self.gaming_date(),
        }
    }

    /// Update pipeline that inserts the transaction into `txns`, or replaces
    /// the entry with the same `transactionID` in place.
    ///
    /// Applying it twice leaves the rollup unchanged apart from
    /// `lastModified`.
    #[must_use]
    pub fn rollup_update(&self, now: DateTime) -> Vec<Document> {
        let entry = doc! {
            "transactionID": self.transaction_id.clone(),
            "value": self.value.clone(),
            "date": self.date,
        };
        let txns = doc! {
            "$let": {
                "vars": {
                    "existing": {
                        "$first": {
                            "$filter": {
                                "input": { "$ifNull": ["$txns", []] },
                                "cond": { "$eq": ["$$this.transactionID", self.transaction_id.clone()] },
                            }
                        }
                    }
                },
                "in": {
                    "$cond": {
                        "if": { "$not": ["$$existing"] },
                        "then": { "$concatArrays": [{ "$ifNull": ["$txns", []] }, [entry.clone()]] },
                        "else": {
                            "$map": {
                                "input": "$txns",
                                "as": "txn",
                                "in": {
                                    "$cond": {
                                        "if": { "$eq": ["$$txn.transactionID", self.transaction_id.clone()] },
                                        "then": entry,
                                        "else": "$$txn",
                                    }
                                },
                            }
                        },
                    }
                },
            }
        };

        vec![doc! {
            "$set": {
                "playerID": self.player_id.clone(),
                "gamingDate": self.gaming_date(),
                "name": { "$ifNull": ["$name", { "$literal": self.name.as_str() }] },
                "txns": txns,
                "lastModified": now,
            }
        }]
    }
}

/// Folds transaction changes into per-player daily rollups.
///
/// Idempotent: redelivering a transaction overwrites its own `txns` entry.
#[derive(Debug, Clone)]
pub struct DailyTransactionHandler {
    collection: String,
    rollups: Collection<Document>,
}

impl DailyTransactionHandler {
    /// Fold changes of `collection` into `rollups`.
    #[must_use]
    pub fn new(collection: impl Into<String>, rollups: Collection<Document>) -> Self {
        Self {
            collection: collection.into(),
            rollups,
        }
    }
}

impl Handler for DailyTransactionHandler {
    fn name(&self) -> &str {
        "daily-transaction"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn process<'a>(
        &'a self,
        event: &'a ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerStatus, HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if !matches!(
                event.operation,
                OperationType::Insert | OperationType::Update | OperationType::Replace
            ) {
                debug!(operation = %event.operation, "No post-image to fold, skipping");
                return Ok(HandlerStatus::SUCCESS);
            }

            let parsed = event
                .full_document
                .as_ref()
                .ok_or_else(|| HandlerError::InvalidDocument("no full document".into()))
                .and_then(Transaction::from_document);
            let transaction = match parsed {
                Ok(transaction) => transaction,
                Err(e) => {
                    error!(
                        key = event.dispatch_key().as_deref().unwrap_or("-"),
                        error = %e,
                        "Invalid transaction document"
                    );
                    return Ok(INVALID_DOCUMENT);
                }
            };

            info!(
                player_id = %transaction.player_id,
                gaming_date = %transaction.gaming_date(),
                "Processing transaction"
            );

            self.rollups
                .update_one(
                    transaction.rollup_filter(),
                    transaction.rollup_update(DateTime::now()),
                )
                .upsert(true)
                .await
                .map_err(|e| HandlerError::Storage(e.to_string()))?;

            info!(
                player_id = %transaction.player_id,
                transaction_id = %transaction.transaction_id,
                "Daily rollup updated"
            );
            Ok(HandlerStatus::SUCCESS)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mongodb::Client;

    // 2024-03-05T17:45:30.250Z
    const AFTERNOON: i64 = 1_709_660_730_250;
    // 2024-03-05T00:00:00Z
    const MIDNIGHT: i64 = 1_709_596_800_000;

    fn transaction_document() -> Document {
        doc! {
            "_id": 1,
            "playerID": 7,
            "transactionID": 1001,
            "value": 12.5,
            "name": "alice",
            "date": DateTime::from_millis(AFTERNOON),
        }
    }

    /// Client construction does not touch the network.
    async fn rollups() -> Collection<Document> {
        Client::with_uri_str("mongodb://127.0.0.1:1")
            .await
            .unwrap()
            .database("demo")
            .collection(DAILY_ROLLUP_COLLECTION)
    }

    #[test]
    fn transaction_reads_required_fields() {
        let transaction = Transaction::from_document(&transaction_document()).unwrap();

        assert_eq!(transaction.player_id, Bson::Int32(7));
        assert_eq!(transaction.transaction_id, Bson::Int32(1001));
        assert_eq!(transaction.name, "alice");
        assert_eq!(transaction.gaming_date(), DateTime::from_millis(MIDNIGHT));
    }

    #[test]
    fn missing_or_null_fields_are_invalid() {
        for name in REQUIRED_FIELDS {
            let mut document = transaction_document();
            document.remove(name);
            assert!(
                matches!(Transaction::from_document(&document), Err(HandlerError::InvalidDocument(ref m)) if m.contains(name)),
                "{name} should be required"
            );
        }

        let mut document = transaction_document();
        document.insert("value", Bson::Null);
        assert!(Transaction::from_document(&document).is_err());

        let mut document = transaction_document();
        document.insert("date", "2024-03-05");
        assert!(Transaction::from_document(&document).is_err());
    }

    #[test]
    fn gaming_date_truncates_before_epoch() {
        let mut document = transaction_document();
        document.insert("date", DateTime::from_millis(-1));
        let transaction = Transaction::from_document(&document).unwrap();

        assert_eq!(transaction.gaming_date(), DateTime::from_millis(-MILLIS_PER_DAY));
    }

    #[test]
    fn rollup_is_keyed_by_player_and_day() {
        let transaction = Transaction::from_document(&transaction_document()).unwrap();

        assert_eq!(
            transaction.rollup_filter(),
            doc! { "playerID": 7, "gamingDate": DateTime::from_millis(MIDNIGHT) }
        );
    }

    #[test]
    fn rollup_update_keeps_first_name_and_keys_txns_by_id() {
        let transaction = Transaction::from_document(&transaction_document()).unwrap();
        let now = DateTime::from_millis(AFTERNOON + 1_000);
        let pipeline = transaction.rollup_update(now);

        assert_eq!(pipeline.len(), 1);
        let set = pipeline[0].get_document("$set").unwrap();
        assert_eq!(set.get_datetime("lastModified").unwrap(), &now);
        assert_eq!(
            set.get_document("name").unwrap(),
            &doc! { "$ifNull": ["$name", { "$literal": "alice" }] }
        );

        let branches = set
            .get_document("txns")
            .unwrap()
            .get_document("$let")
            .unwrap()
            .get_document("in")
            .unwrap()
            .get_document("$cond")
            .unwrap();
        let appended = branches
            .get_document("then")
            .unwrap()
            .get_array("$concatArrays")
            .unwrap();
        assert_eq!(
            appended[1],
            bson::bson!([{ "transactionID": 1001, "value": 12.5, "date": DateTime::from_millis(AFTERNOON) }])
        );
        assert!(branches.get_document("else").unwrap().contains_key("$map"));
    }

    #[tokio::test]
    async fn logging_handler_succeeds() {
        let handler = LoggingHandler::new("userdailytxn");
        let event = ChangeEvent::new(OperationType::Delete).with_document_key(doc! { "_id": 1 });

        assert_eq!(handler.collection(), "userdailytxn");
        assert_eq!(handler.process(&event).await.unwrap(), HandlerStatus::SUCCESS);
    }

    #[tokio::test]
    async fn invalid_transaction_returns_non_zero_status() {
        let handler = DailyTransactionHandler::new(TRANSACTIONS_COLLECTION, rollups().await);

        let mut document = transaction_document();
        document.remove("playerID");
        let missing_field = ChangeEvent::new(OperationType::Insert)
            .with_document_key(doc! { "_id": 1 })
            .with_full_document(document);
        assert_eq!(handler.process(&missing_field).await.unwrap(), INVALID_DOCUMENT);

        let no_image = ChangeEvent::new(OperationType::Update).with_document_key(doc! { "_id": 1 });
        assert_eq!(handler.process(&no_image).await.unwrap(), INVALID_DOCUMENT);
    }

    #[tokio::test]
    async fn deletes_are_skipped() {
        let handler = DailyTransactionHandler::new(TRANSACTIONS_COLLECTION, rollups().await);
        let event = ChangeEvent::new(OperationType::Delete).with_document_key(doc! { "_id": 1 });

        assert_eq!(handler.process(&event).await.unwrap(), HandlerStatus::SUCCESS);
    }

    #[tokio::test]
    async fn unknown_collections_fall_back_to_logging() {
        let db = Client::with_uri_str("mongodb://127.0.0.1:1")
            .await
            .unwrap()
            .database("demo");

        let daily = handler_for(&db, TRANSACTIONS_COLLECTION);
        assert_eq!(daily.name(), "daily-transaction");
        assert_eq!(daily.collection(), TRANSACTIONS_COLLECTION);

        let other = handler_for(&db, "orders");
        assert_eq!(other.name(), "logging");
        assert_eq!(other.collection(), "orders");
    }
}
