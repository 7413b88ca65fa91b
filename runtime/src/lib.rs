//! # Changefeed Runtime
//!
//! Runtime for the change-feed consumer: listeners, worker pools, the
//! per-event step, metrics and lifecycle.
//!
//! ## Core Components
//!
//! - **Mediator**: binds handlers to change sources, starts and stops everything
//! - **Listener**: one per collection, keeps the cursor open and retries faults
//! - **Worker pool**: N single-writer workers per collection, routed by key hash
//! - **Business step**: runs the handler, records metrics, saves the resume token
//! - **Metrics**: per-collection Prometheus instruments and the scrape server
//!
//! ## Example
//!
//! ```ignore
//! use changefeed_runtime::{Mediator, MediatorConfig, MetricsRegistry};
//! use std::sync::Arc;
//!
//! let mut mediator = Mediator::builder(MediatorConfig::new(4))
//!     .store(store)
//!     .metrics(MetricsRegistry::global())
//!     .bind(Arc::new(OrdersHandler), orders_source)
//!     .build()?;
//!
//! mediator.start()?;
//! changefeed_runtime::signal::wait_for_signal().await?;
//! let report = mediator.shutdown(mediator.config().shutdown_timeout).await;
//! ```

/// TOML configuration and environment overrides
pub mod config;

/// Key-hash routing and the per-collection worker pool
pub mod dispatch;

/// Health reporting for the scrape server
pub mod health;

/// Per-collection listener state machine
pub mod listener;

/// Lifecycle owner for all listeners and pools
pub mod mediator;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Shutdown signal handling
pub mod signal;

/// Per-event lifecycle
pub mod step;

/// Throughput estimation
pub mod tps;

pub use config::{ConfigError, ConsumerConfig};
pub use dispatch::{DispatchError, DrainReport, PoolSender, Submitted, WorkerPool, partition};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use listener::{Listener, ListenerState, ListenerStates};
pub use mediator::{Mediator, MediatorBuilder, MediatorConfig, MediatorError, ShutdownReport};
pub use metrics::{MetricSet, MetricsError, MetricsRegistry, MetricsServer};
pub use retry::{Backoff, RetryPolicy};
pub use step::{BusinessStep, StepOutcome};
pub use tps::TpsEstimator;
