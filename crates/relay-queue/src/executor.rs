//! Step executor trait and job-type registry.
//!
//! The engine never interprets a job's payload; it hands the payload to the
//! step executor registered for the job's type tag and acts on the outcome.
//! Dispatch is a registry lookup by type tag, not inheritance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::{JobId, TenantId};

use crate::error::{Error, Result};

/// Observable progress reported alongside a `Continue` outcome.
///
/// Purely informational: surfaced through the event trail for polling
/// clients, never read by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Stage name (e.g., `"outline"`, `"chapter-3"`).
    pub stage: String,
    /// Completion percentage, if the executor can estimate one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    /// Human-readable status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    /// Creates a progress descriptor for a named stage.
    #[must_use]
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            percent: None,
            message: None,
        }
    }

    /// Sets the completion percentage.
    #[must_use]
    pub const fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    /// Sets the status message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outcome of one bounded step of work.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// More work remains. The updated payload carries whatever partial state
    /// lets a future invocation resume.
    Continue {
        /// Updated payload written back to the record.
        payload: Value,
        /// Optional progress descriptor for the event trail.
        progress: Option<Progress>,
    },
    /// The job is complete.
    Done {
        /// Result blob written to the record.
        result: Value,
    },
    /// The step failed; the engine applies the retry budget.
    Failed {
        /// Error message (truncated to a bounded length when stored).
        error: String,
    },
}

/// What the worker does with the lease after a `Continue` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationStyle {
    /// Keep the job `Processing`; the same scheduled worker stream is
    /// expected to pick the next step up (resume by explicit job id).
    HoldLease,
    /// Return the job to `Pending` so a different invocation claims it.
    /// Used when a bounded invocation cannot span a slow remote call.
    YieldToQueue,
}

/// Context handed to every step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The job being executed.
    pub job_id: JobId,
    /// The queue the job lives in.
    pub queue: String,
    /// Tenant partition key.
    pub tenant_id: TenantId,
    /// Retry attempts consumed so far.
    pub retry_count: u32,
}

/// Business logic plugged into the worker, one implementation per job type.
///
/// Implementations must keep each step bounded: the hosting model imposes
/// per-invocation time limits, so long multi-stage work is expressed as a
/// sequence of `Continue` outcomes rather than one long call.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Performs one bounded unit of work against the current payload.
    async fn step(&self, ctx: &StepContext, payload: Value) -> StepOutcome;

    /// Validates a payload at enqueue time.
    ///
    /// Rejections surface as [`Error::InvalidPayload`] before any row is
    /// created. The default accepts everything.
    ///
    /// # Errors
    ///
    /// Returns a description of what made the payload invalid.
    fn validate_payload(&self, payload: &Value) -> std::result::Result<(), String> {
        let _ = payload;
        Ok(())
    }

    /// Chaining policy applied after a `Continue` outcome.
    ///
    /// Defaults to yielding back to the queue, the safe choice for
    /// invocation-bounded hosts.
    fn continuation(&self) -> ContinuationStyle {
        ContinuationStyle::YieldToQueue
    }
}

/// Registry mapping job-type tags to step executors.
///
/// This is tagged-variant dispatch: the `job_type` string on the record
/// selects the implementation. Unknown tags fail enqueue with
/// [`Error::UnknownJobType`] and no row is written.
#[derive(Clone, Default)]
pub struct Registry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor for a job type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(job_type.into(), executor);
    }

    /// Looks up the executor for a job type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownJobType`] if no executor is registered.
    pub fn get(&self, job_type: &str) -> Result<Arc<dyn StepExecutor>> {
        self.executors
            .get(job_type)
            .cloned()
            .ok_or_else(|| Error::UnknownJobType {
                job_type: job_type.to_string(),
            })
    }

    /// Returns true if the job type has a registered executor.
    #[must_use]
    pub fn contains(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    /// Returns the registered job-type tags.
    #[must_use]
    pub fn job_types(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
