//! Change-stream cursor over one collection.

use crate::error::source_error;
use bson::Document;
use changefeed_core::event::{ChangeEvent, OperationType, ResumeToken};
use changefeed_core::source::{
    ChangeSource, ChangeStream, FullDocumentBeforeChange, FullDocumentMode, SourceError,
    WatchOptions,
};
use futures::StreamExt;
use mongodb::Collection;
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken as DriverToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentBeforeChangeType, FullDocumentType};
use std::future::Future;
use std::pin::Pin;

/// [`ChangeSource`] backed by `collection.watch()`.
#[derive(Debug, Clone)]
pub struct MongoChangeSource {
    collection: Collection<Document>,
    name: String,
}

impl MongoChangeSource {
    /// Watch `collection`.
    #[must_use]
    pub fn new(collection: Collection<Document>) -> Self {
        let name = collection.name().to_string();
        Self { collection, name }
    }
}

impl ChangeSource for MongoChangeSource {
    fn collection(&self) -> &str {
        &self.name
    }

    fn watch(
        &self,
        options: WatchOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let driver_options = driver_options(&options)?;
            let cursor = self
                .collection
                .watch()
                .with_options(driver_options)
                .await
                .map_err(|e| source_error(&e))?;

            tracing::debug!(
                collection = %self.name,
                resumed = options.resume_after.is_some(),
                "Change stream cursor opened"
            );

            let stream = cursor.map(|item| match item {
                Ok(event) => to_change_event(event),
                Err(error) => Err(source_error(&error)),
            });
            Ok(Box::pin(stream) as ChangeStream)
        })
    }
}

fn driver_options(options: &WatchOptions) -> Result<ChangeStreamOptions, SourceError> {
    let full_document = match options.full_document {
        FullDocumentMode::Default => None,
        FullDocumentMode::UpdateLookup => Some(FullDocumentType::UpdateLookup),
        FullDocumentMode::WhenAvailable => Some(FullDocumentType::WhenAvailable),
        FullDocumentMode::Required => Some(FullDocumentType::Required),
    };
    let before_change = match options.full_document_before_change {
        FullDocumentBeforeChange::Off => FullDocumentBeforeChangeType::Off,
        FullDocumentBeforeChange::WhenAvailable => FullDocumentBeforeChangeType::WhenAvailable,
        FullDocumentBeforeChange::Required => FullDocumentBeforeChangeType::Required,
    };
    let resume_after = options
        .resume_after
        .as_ref()
        .map(to_driver_token)
        .transpose()?;

    let mut driver = ChangeStreamOptions::default();
    driver.full_document = full_document;
    driver.full_document_before_change = Some(before_change);
    driver.resume_after = resume_after;
    Ok(driver)
}

fn to_driver_token(token: &ResumeToken) -> Result<DriverToken, SourceError> {
    let encode = |e: &dyn std::fmt::Display| SourceError::Other(format!("cannot encode resume token: {e}"));
    let document = bson::to_document(token).map_err(|e| encode(&e))?;
    bson::from_document(document).map_err(|e| encode(&e))
}

fn from_driver_token(token: &DriverToken) -> Result<ResumeToken, SourceError> {
    let decode = |e: &dyn std::fmt::Display| SourceError::Other(format!("cannot decode resume token: {e}"));
    let value = bson::to_bson(token).map_err(|e| decode(&e))?;
    bson::from_bson(value).map_err(|e| decode(&e))
}

/// Convert a driver change event.
///
/// # Errors
///
/// Returns [`SourceError::Other`] if the event's resume token is not of the
/// `{ _data: <string> }` form.
pub fn to_change_event(event: ChangeStreamEvent<Document>) -> Result<ChangeEvent, SourceError> {
    let operation = bson::to_bson(&event.operation_type)
        .ok()
        .and_then(|value| value.as_str().map(OperationType::from))
        .unwrap_or_else(|| OperationType::Other(format!("{:?}", event.operation_type)));

    let mut change = ChangeEvent::new(operation).with_resume_token(from_driver_token(&event.id)?);
    change.document_key = event.document_key;
    change.full_document = event.full_document;
    change.full_document_before_change = event.full_document_before_change;
    change.cluster_time = event.cluster_time.map(Into::into);
    Ok(change)
}
