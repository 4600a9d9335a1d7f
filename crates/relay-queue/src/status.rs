//! Read-side status API.
//!
//! Polling clients (dashboards, chain orchestration callers) read a job's
//! observable fields plus its recent event trail. Reads never mutate queue
//! state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use relay_core::{JobId, TenantId};

use crate::error::{Error, Result};
use crate::events::JobEvent;
use crate::job::{ChainLink, JobRecord, JobStatus};
use crate::store::JobStore;

/// The observable fields of a job record.
///
/// Clients are expected to treat `FAILED` as transient (the engine may still
/// retry) and `DEAD_LETTER` as requiring escalation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    /// Job identifier.
    pub id: JobId,
    /// Queue name.
    pub queue: String,
    /// Job type tag.
    pub job_type: String,
    /// Tenant partition key.
    pub tenant_id: TenantId,
    /// Current status.
    pub status: JobStatus,
    /// Current payload, including any partial progress state.
    pub payload: Value,
    /// Result blob, present iff the job is `DONE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Most recent error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry attempts consumed so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the job was first claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last heartbeat from the worker holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Chain membership, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainLink>,
}

impl From<JobRecord> for JobView {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            queue: job.queue,
            job_type: job.job_type,
            tenant_id: job.tenant_id,
            status: job.status,
            payload: job.payload,
            result: job.result,
            error: job.error,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            last_heartbeat: job.last_heartbeat,
            chain: job.chain,
        }
    }
}

/// Status response: the record plus its recent events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    /// The job's observable fields.
    pub job: JobView,
    /// Event trail in ascending sequence order (most recent `events_limit`
    /// entries when a limit was given).
    pub events: Vec<JobEvent>,
}

/// Read-only access to job status and event trails.
#[derive(Clone)]
pub struct StatusReader {
    store: Arc<dyn JobStore>,
}

impl StatusReader {
    /// Creates a reader over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Returns a job's status and recent events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if the job does not exist.
    pub async fn job_status(
        &self,
        queue: &str,
        id: &JobId,
        events_limit: Option<usize>,
    ) -> Result<JobStatusView> {
        let job = self
            .store
            .get(queue, id)
            .await?
            .ok_or_else(|| Error::JobNotFound {
                job_id: *id,
                queue: queue.to_string(),
            })?;
        let events = self.store.events(queue, id, events_limit).await?;

        Ok(JobStatusView {
            job: job.into(),
            events,
        })
    }
}

impl std::fmt::Debug for StatusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReader").finish_non_exhaustive()
    }
}
