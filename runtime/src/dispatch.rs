//! Hash-partitioned worker pools.
//!
//! Each collection gets `N` workers. A worker owns the receiving side of one
//! FIFO queue and runs a [`BusinessStep`] for each event it dequeues, so events
//! are handled by exactly one task per partition. Events are routed by
//! `hash(dispatch_key) mod N`, which keeps every event of a document on the same
//! worker and therefore in cursor order.
//!
//! ```text
//!                     ┌─► queue w0 ─► worker w0 ─► BusinessStep
//! listener ─submit()──┼─► queue w1 ─► worker w1 ─► BusinessStep
//!                     └─► queue w2 ─► worker w2 ─► BusinessStep
//! ```
//!
//! Submitting never waits for a handler. Queues are unbounded unless a capacity
//! is configured, in which case an event arriving at a full queue is dropped
//! and counted in `<coll>_events_dropped_total`.

use crate::metrics::MetricSet;
use crate::step::BusinessStep;
use changefeed_core::event::{ChangeEvent, WorkerId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors from [`PoolSender::submit`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The event has no usable document key
    #[error("Event has no document key")]
    MissingKey,
    /// The target worker has stopped
    #[error("Worker {0} is no longer accepting events")]
    WorkerClosed(WorkerId),
}

/// Result of a successful [`PoolSender::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Enqueued for this worker
    Queued(WorkerId),
    /// The worker's bounded queue was full and the event was dropped
    Dropped(WorkerId),
}

/// Worker index for `key` in a pool of `workers`.
///
/// A pure function of its inputs; uses the fixed-key std hasher so the result
/// is the same on every call.
#[must_use]
// The remainder is below `workers`, which came from a usize.
#[allow(clippy::cast_possible_truncation)]
pub fn partition(key: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

#[derive(Debug, Clone)]
enum QueueSender {
    Unbounded(mpsc::UnboundedSender<ChangeEvent>),
    Bounded(mpsc::Sender<ChangeEvent>),
}

#[derive(Debug)]
enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<ChangeEvent>),
    Bounded(mpsc::Receiver<ChangeEvent>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<ChangeEvent> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

fn queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

/// Submitting side of a pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PoolSender {
    collection: Arc<str>,
    queues: Arc<[QueueSender]>,
    metrics: Arc<MetricSet>,
}

impl PoolSender {
    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Worker an event would be routed to.
    #[must_use]
    pub fn route(&self, event: &ChangeEvent) -> Option<WorkerId> {
        event
            .dispatch_key()
            .map(|key| WorkerId(partition(&key, self.queues.len())))
    }

    /// Enqueue an event on its partition's worker without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingKey`] if the event has no document key
    /// and [`DispatchError::WorkerClosed`] if the worker has stopped.
    pub fn submit(&self, event: ChangeEvent) -> Result<Submitted, DispatchError> {
        let worker = self.route(&event).ok_or(DispatchError::MissingKey)?;
        let Some(queue) = self.queues.get(worker.index()) else {
            return Err(DispatchError::WorkerClosed(worker));
        };

        match queue {
            QueueSender::Unbounded(tx) => tx
                .send(event)
                .map(|()| Submitted::Queued(worker))
                .map_err(|_| DispatchError::WorkerClosed(worker)),
            QueueSender::Bounded(tx) => match tx.try_send(event) {
                Ok(()) => Ok(Submitted::Queued(worker)),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.record_dropped();
                    tracing::warn!(
                        collection = %self.collection,
                        worker = %worker,
                        "Worker queue full, dropping event"
                    );
                    Ok(Submitted::Dropped(worker))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::WorkerClosed(worker)),
            },
        }
    }
}

/// Outcome of draining a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Workers that finished their queue before the deadline
    pub drained: usize,
    /// Workers aborted at the deadline
    pub aborted: usize,
}

/// One collection's workers.
#[derive(Debug)]
pub struct WorkerPool {
    collection: String,
    sender: Option<PoolSender>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks, building each one's step with `make_step`.
    ///
    /// `capacity` bounds each queue; `None` leaves them unbounded. Must be
    /// called from within a tokio runtime.
    pub fn spawn<F>(
        collection: &str,
        workers: usize,
        capacity: Option<usize>,
        metrics: Arc<MetricSet>,
        mut make_step: F,
    ) -> Self
    where
        F: FnMut(WorkerId) -> BusinessStep,
    {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = queue(capacity);
            senders.push(tx);
            let step = make_step(WorkerId(index));
            handles.push(tokio::spawn(run_worker(collection.to_string(), rx, step)));
        }

        tracing::debug!(collection, workers, ?capacity, "Worker pool started");

        Self {
            collection: collection.to_string(),
            sender: Some(PoolSender {
                collection: Arc::from(collection),
                queues: senders.into(),
                metrics,
            }),
            workers: handles,
        }
    }

    /// A submitting handle, or `None` once draining started.
    #[must_use]
    pub fn sender(&self) -> Option<PoolSender> {
        self.sender.clone()
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Close the queues and wait for workers to finish what is queued.
    ///
    /// Workers still busy at `deadline` are aborted. Queues only close once
    /// every [`PoolSender`] clone is dropped, so stop the submitters first.
    pub async fn drain(mut self, deadline: Instant) -> DrainReport {
        self.sender = None;
        let mut report = DrainReport::default();

        for (index, mut handle) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.drained += 1,
                Err(_) => {
                    handle.abort();
                    report.aborted += 1;
                    tracing::warn!(
                        collection = %self.collection,
                        worker = %WorkerId(index),
                        "Worker did not drain before deadline, aborting"
                    );
                }
            }
        }

        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

async fn run_worker(collection: String, mut queue: QueueReceiver, mut step: BusinessStep) {
    let worker = step.worker();
    tracing::debug!(collection = %collection, worker = %worker, "Worker started");

    while let Some(event) = queue.recv().await {
        step.run(&event).await;
    }

    tracing::debug!(collection = %collection, worker = %worker, "Worker queue drained");
}
