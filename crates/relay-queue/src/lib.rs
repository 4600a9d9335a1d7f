//! # relay-queue
//!
//! At-least-once background job processing with retries, heartbeats,
//! stale-job reconciliation, dead-lettering, and a chaining protocol for
//! long-running multi-step work.
//!
//! The engine is built for invocation-bounded hosts: a worker is a
//! short-lived, possibly-concurrent, stateless request, and many may run in
//! parallel across processes with no shared memory. All coordination goes
//! through the job store's conditional updates, never through in-process
//! locks.
//!
//! ## Core Concepts
//!
//! - **Job**: one unit of asynchronous work tracked as a durable record
//! - **Step**: one bounded execution against the job's current payload,
//!   yielding `Continue`, `Done`, or `Failed`
//! - **Lease**: the window during which a processing job's heartbeat is
//!   fresh and the job is not eligible for reclaim
//! - **Chain**: ordered units of a composite whose advancement is gated by
//!   an explicit pause/resume flag
//!
//! ## Guarantees
//!
//! - At most one concurrent claim wins a pending job
//! - `retry_count` is monotonic; a job dead-letters exactly when a failure
//!   or stale reclaim would exceed `max_retries`
//! - Terminal jobs are never mutated by workers or the reconciler
//! - A job inside its lease window is never reclaimed; a job outside it is
//!   eventually requeued or dead-lettered
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use relay_core::TenantId;
//! use relay_queue::chain::ChainController;
//! use relay_queue::config::QueueConfig;
//! use relay_queue::enqueue::{EnqueueRequest, Enqueuer};
//! use relay_queue::executor::{Registry, StepContext, StepExecutor, StepOutcome};
//! use relay_queue::store::memory::InMemoryJobStore;
//! use relay_queue::store::JobStore;
//! use relay_queue::worker::Worker;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl StepExecutor for Echo {
//!     async fn step(&self, _ctx: &StepContext, payload: serde_json::Value) -> StepOutcome {
//!         StepOutcome::Done { result: payload }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
//! let mut registry = Registry::new();
//! registry.register("echo", Arc::new(Echo));
//!
//! let enqueuer = Enqueuer::new(store.clone(), registry.clone());
//! let chains = ChainController::new(store.clone(), enqueuer.clone());
//! let worker = Worker::new(store, registry, chains, QueueConfig::default());
//!
//! let tenant = TenantId::new("acme-academy")?;
//! let job_id = enqueuer
//!     .enqueue(EnqueueRequest::new(
//!         "agent-jobs",
//!         "echo",
//!         tenant,
//!         serde_json::json!({"hello": "world"}),
//!     ))
//!     .await?;
//!
//! let summary = worker.run_pass("agent-jobs", None).await?;
//! println!("processed {job_id}: {summary:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod chain;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::chain::{ChainController, ChainPlan, ChainUnit};
    pub use crate::config::{BackoffPolicy, QueueConfig};
    pub use crate::enqueue::{EnqueueRequest, Enqueuer};
    pub use crate::error::{Error, Result};
    pub use crate::events::{JobEvent, JobEventKind};
    pub use crate::executor::{
        ContinuationStyle, Progress, Registry, StepContext, StepExecutor, StepOutcome,
    };
    pub use crate::job::{JobRecord, JobStatus, TransitionReason};
    pub use crate::metrics::QueueMetrics;
    pub use crate::reconciler::{ReconcileSummary, Reconciler};
    pub use crate::status::{JobStatusView, StatusReader};
    pub use crate::store::memory::InMemoryJobStore;
    pub use crate::store::{CasResult, ClaimOutcome, FailureOutcome, JobStore, SweepOutcome};
    pub use crate::worker::{PassSummary, StepDisposition, Worker};
}
