//! Per-event lifecycle.
//!
//! A [`BusinessStep`] wraps one worker's handler call with the bookkeeping every
//! event gets, in this order:
//!
//! 1. note the start time and the event's cluster time
//! 2. record the arrival in the worker's TPS estimator
//! 3. call the handler (errors and panics are caught)
//! 4. count the event as handled, then as successful if the status is zero
//! 5. set the worker's lag gauge (`start − cluster time`, never negative)
//! 6. set the worker's TPS gauge
//! 7. observe the handler duration into both histograms
//! 8. on success, persist the event's resume token for `(collection, worker)`
//!    unless it is older than the last token this step persisted
//!
//! A failed event never persists a token. Later successful events on the same
//! worker still do, so recovery of a failed event relies on redelivery and
//! handler idempotence.

use crate::metrics::MetricSet;
use crate::tps::TpsEstimator;
use changefeed_core::checkpoint::ResumeTokenStore;
use changefeed_core::event::{ChangeEvent, ClusterTime, WorkerId};
use changefeed_core::handler::{Handler, HandlerError, HandlerStatus};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;

/// What happened to one event.
#[derive(Debug)]
pub enum StepOutcome {
    /// Handler succeeded; `checkpointed` tells whether a token was persisted
    Succeeded {
        /// Whether the resume token was saved
        checkpointed: bool,
    },
    /// Handler returned a non-zero status
    Failed(HandlerStatus),
    /// Handler returned an error or panicked
    Errored(HandlerError),
}

impl StepOutcome {
    /// Whether the handler succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// One worker's event lifecycle.
pub struct BusinessStep {
    collection: String,
    worker: WorkerId,
    handler: Arc<dyn Handler>,
    store: Arc<dyn ResumeTokenStore>,
    metrics: Arc<MetricSet>,
    tps: TpsEstimator,
    last_saved: Option<ClusterTime>,
}

impl BusinessStep {
    /// Create the step for `worker` of the handler's collection.
    #[must_use]
    pub fn new(
        worker: WorkerId,
        handler: Arc<dyn Handler>,
        store: Arc<dyn ResumeTokenStore>,
        metrics: Arc<MetricSet>,
        tps_alpha: f64,
    ) -> Self {
        Self {
            collection: handler.collection().to_string(),
            worker,
            handler,
            store,
            metrics,
            tps: TpsEstimator::new(tps_alpha),
            last_saved: None,
        }
    }

    /// Worker this step runs on.
    #[must_use]
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Run the lifecycle for one event.
    pub async fn run(&mut self, event: &ChangeEvent) -> StepOutcome {
        let started = Instant::now();
        let started_wall = Utc::now();
        let cluster_time = event.cluster_time;

        self.tps.record_at(started);

        let result = AssertUnwindSafe(self.handler.process(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));

        self.metrics.record_handled();
        let outcome = match result {
            Ok(status) if status.is_success() => {
                self.metrics.record_success();
                StepOutcome::Succeeded {
                    checkpointed: false,
                }
            }
            Ok(status) => {
                tracing::warn!(
                    collection = %self.collection,
                    worker = %self.worker,
                    handler = self.handler.name(),
                    status = status.as_i32(),
                    "Handler returned failure status"
                );
                StepOutcome::Failed(status)
            }
            Err(error) => {
                tracing::error!(
                    collection = %self.collection,
                    worker = %self.worker,
                    handler = self.handler.name(),
                    error = %error,
                    "Handler failed"
                );
                StepOutcome::Errored(error)
            }
        };

        if let Some(cluster_time) = cluster_time {
            #[allow(clippy::cast_precision_loss)] // millisecond lags fit easily
            let lag = (started_wall.timestamp_millis() - cluster_time.as_millis()).max(0) as f64;
            self.metrics.set_lag(self.worker, lag);
        }
        self.metrics.set_tps(self.worker, self.tps.tps());
        self.metrics.record_duration(started.elapsed());

        match outcome {
            StepOutcome::Succeeded { .. } => StepOutcome::Succeeded {
                checkpointed: self.checkpoint(event).await,
            },
            other => other,
        }
    }

    async fn checkpoint(&mut self, event: &ChangeEvent) -> bool {
        let Some(token) = event.resume_token.as_ref() else {
            return false;
        };
        let Some(cluster_time) = event.cluster_time else {
            tracing::warn!(
                collection = %self.collection,
                worker = %self.worker,
                "Event has a resume token but no cluster time, not checkpointing"
            );
            return false;
        };
        if self.last_saved.is_some_and(|last| cluster_time < last) {
            tracing::debug!(
                collection = %self.collection,
                worker = %self.worker,
                cluster_time = %cluster_time,
                "Replayed event is behind the worker's checkpoint, not saving"
            );
            return false;
        }

        match self
            .store
            .save(&self.collection, self.worker, token, cluster_time)
            .await
        {
            Ok(()) => {
                tracing::trace!(
                    collection = %self.collection,
                    worker = %self.worker,
                    cluster_time = %cluster_time,
                    "Resume token saved"
                );
                self.last_saved = Some(cluster_time);
                true
            }
            Err(error) => {
                tracing::error!(
                    collection = %self.collection,
                    worker = %self.worker,
                    error = %error,
                    "Failed to save resume token"
                );
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
