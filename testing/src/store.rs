//! In-memory resume-token store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use changefeed_core::checkpoint::{ResumeRecord, ResumeTokenStore, StoreError};
use changefeed_core::event::{ClusterTime, ResumeToken, WorkerId};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// `HashMap`-backed [`ResumeTokenStore`] keyed by `(collection, worker)`.
///
/// Clones share state, so a test can keep one handle for assertions and give
/// another to the mediator.
///
/// # Example
///
/// ```
/// use changefeed_core::checkpoint::ResumeTokenStore;
/// use changefeed_core::event::{ClusterTime, ResumeToken, WorkerId};
/// use changefeed_testing::InMemoryResumeTokenStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryResumeTokenStore::new();
/// store.save("orders", WorkerId(0), &ResumeToken::new("b"), ClusterTime::new(20, 0)).await?;
/// store.save("orders", WorkerId(1), &ResumeToken::new("a"), ClusterTime::new(10, 0)).await?;
///
/// assert_eq!(store.load("orders").await?, Some(ResumeToken::new("a")));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryResumeTokenStore {
    records: Arc<RwLock<HashMap<(String, String), ResumeRecord>>>,
    load_faults: Arc<Mutex<VecDeque<StoreError>>>,
    save_faults: Arc<Mutex<VecDeque<StoreError>>>,
    saves: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
}

impl InMemoryResumeTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing `save`.
    pub fn seed(&self, record: ResumeRecord) {
        let key = (record.collection_name.clone(), record.worker.clone());
        self.records.write().unwrap().insert(key, record);
    }

    /// Make the next `load` fail with `error`.
    pub fn fail_next_load(&self, error: StoreError) {
        self.load_faults.lock().unwrap().push_back(error);
    }

    /// Make the next `save` fail with `error`.
    pub fn fail_next_save(&self, error: StoreError) {
        self.save_faults.lock().unwrap().push_back(error);
    }

    /// Record stored for `(collection, worker)`.
    #[must_use]
    pub fn record(&self, collection: &str, worker: WorkerId) -> Option<ResumeRecord> {
        self.records
            .read()
            .unwrap()
            .get(&(collection.to_string(), worker.to_string()))
            .cloned()
    }

    /// All records for `collection`, ordered by worker label.
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<ResumeRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.collection_name == collection)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.worker.cmp(&b.worker));
        records
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `load` calls, failed ones included.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Drop every record (simulates a fresh deployment).
    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }
}

impl ResumeTokenStore for InMemoryResumeTokenStore {
    fn save<'a>(
        &'a self,
        collection: &'a str,
        worker: WorkerId,
        token: &'a ResumeToken,
        cluster_time: ClusterTime,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(error) = self.save_faults.lock().unwrap().pop_front() {
                return Err(error);
            }
            let record =
                ResumeRecord::new(collection, worker, token.clone(), cluster_time, Utc::now());
            {
                let mut records = self.records.write().unwrap();
                let key = (record.collection_name.clone(), record.worker.clone());
                let stale = records
                    .get(&key)
                    .is_some_and(|stored| stored.cluster_time() > cluster_time);
                if !stale {
                    records.insert(key, record);
                }
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        collection: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResumeToken>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.load_faults.lock().unwrap().pop_front() {
                return Err(error);
            }
            let earliest = self
                .records
                .read()
                .unwrap()
                .values()
                .filter(|r| r.collection_name == collection)
                .min_by(|a, b| {
                    a.cluster_time()
                        .cmp(&b.cluster_time())
                        .then_with(|| a.worker.cmp(&b.worker))
                })
                .map(|r| r.resume_token.clone());
            Ok(earliest)
        })
    }
}
