//! Job record state and lifecycle management.
//!
//! This module provides:
//! - `JobStatus`: The state machine for queued work
//! - `JobRecord`: The durable row tracking a single unit of work
//! - `TransitionReason`: Explicit reasons for all status transitions
//! - `ChainLink`: Membership of a composite chain

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::{ChainId, JobId, TenantId};

use crate::error::{Error, Result};

/// Maximum stored length of an error message, in bytes.
///
/// Step executors may surface arbitrarily large upstream failures; the record
/// keeps a bounded prefix so the row stays small and pollable.
pub const MAX_ERROR_LEN: usize = 2048;

/// Reason for a job status transition.
///
/// Every status transition must have an explicit reason for:
/// - Auditing and debugging
/// - Metrics and alerting
/// - Distinguishing business failures from infrastructure reclaims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Worker claimed the job for execution.
    Claimed,
    /// Step executor yielded an updated payload and the lease was kept.
    StepContinued,
    /// Step executor yielded and the job was returned to the queue so a
    /// future invocation resumes it.
    StepYielded,
    /// Step executor completed the job.
    StepSucceeded,
    /// Step executor reported a failure; retry budget remains.
    StepFailed,
    /// Retry backoff elapsed, job is claimable again.
    RetryDue,
    /// Heartbeat lease expired while processing.
    LeaseExpired,
    /// Pending job exceeded the never-claimed age threshold.
    NeverClaimed,
    /// Retry budget exhausted.
    RetriesExhausted,
    /// Operator manually requeued a dead-lettered job.
    ManualRequeue,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claimed => write!(f, "claimed"),
            Self::StepContinued => write!(f, "step_continued"),
            Self::StepYielded => write!(f, "step_yielded"),
            Self::StepSucceeded => write!(f, "step_succeeded"),
            Self::StepFailed => write!(f, "step_failed"),
            Self::RetryDue => write!(f, "retry_due"),
            Self::LeaseExpired => write!(f, "lease_expired"),
            Self::NeverClaimed => write!(f, "never_claimed"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::ManualRequeue => write!(f, "manual_requeue"),
        }
    }
}

/// Job status state machine.
///
/// Statuses follow a directed graph:
/// ```text
///                claim                    Done
/// ┌─────────┐ ──────────► ┌────────────┐ ─────► ┌──────┐
/// │ PENDING │             │ PROCESSING │        │ DONE │
/// └─────────┘ ◄────────── └────────────┘        └──────┘
///    ▲  │      yield /         │    │
///    │  │      lease expired   │    │ Failed, budget exhausted /
///    │  │                      │    │ lease expired, budget exhausted
///    │  │ never claimed        ▼    ▼
///    │  │     ┌───────┐   ┌────────┐   ┌─────────────┐
///    │  └───► │ STALE │   │ FAILED │   │ DEAD_LETTER │
///    │        └───┬───┘   └────┬───┘   └──────┬──────┘
///    │            │ claim      │ backoff      │ manual requeue
///    │            ▼            │ elapsed      │
///    │       PROCESSING        │              │
///    └─────────────────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Enqueued, waiting to be claimed.
    Pending,
    /// Claimed by a worker invocation holding the heartbeat lease.
    Processing,
    /// Completed successfully; `result` is written.
    Done,
    /// Failed with retry budget remaining; waiting out the backoff.
    Failed,
    /// Retry budget exhausted; requires manual operator recovery.
    DeadLetter,
    /// Enqueued but never claimed within the max-age threshold; flagged for
    /// operator visibility while remaining claimable.
    Stale,
}

impl JobStatus {
    /// Returns true if this is a terminal status.
    ///
    /// `DeadLetter` is terminal for every automatic process; only a manual
    /// operator requeue reintroduces the job.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::DeadLetter)
    }

    /// Returns true if a worker claim may transition this status to
    /// `Processing`.
    #[must_use]
    pub const fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Stale)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Processing | Self::Stale | Self::DeadLetter),
            Self::Processing => matches!(
                target,
                Self::Pending | Self::Done | Self::Failed | Self::DeadLetter
            ),
            Self::Failed => matches!(target, Self::Pending),
            Self::Stale => matches!(target, Self::Processing | Self::DeadLetter),
            Self::DeadLetter => matches!(target, Self::Pending),
            Self::Done => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::Stale => "stale",
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::DeadLetter => write!(f, "DEAD_LETTER"),
            Self::Stale => write!(f, "STALE"),
        }
    }
}

/// Membership of a composite chain.
///
/// Present only on jobs enqueued as chain units; the worker uses it to
/// notify the chain controller when the unit completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLink {
    /// The chain this job belongs to.
    pub chain_id: ChainId,
    /// Zero-based position of this unit within the chain.
    pub unit: usize,
}

/// A durable row representing one unit of queued work.
///
/// The record is the only shared mutable resource in the engine; every
/// mutation goes through the store's conditional updates, never through
/// in-memory locks shared between invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique job identifier, generated at enqueue time.
    pub id: JobId,
    /// The logical job table this record lives in.
    pub queue: String,
    /// Type tag selecting the step executor.
    pub job_type: String,
    /// Tenant partition key; opaque to the engine.
    pub tenant_id: TenantId,
    /// Current status.
    pub status: JobStatus,
    /// Opaque carrier for the original request and any partial state a step
    /// executor needs to resume. Only the executor interprets its shape.
    pub payload: Value,
    /// Result blob, written once on transition to `Done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Most recent error message (bounded length).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure-triggered requeues so far. Never decreases.
    pub retry_count: u32,
    /// Retry budget; exceeding it dead-letters the job.
    pub max_retries: u32,
    /// Earliest instant a `Failed` job becomes claimable again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    pub updated_at: DateTime<Utc>,
    /// When the job was first claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last heartbeat written by the worker holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Reason for the most recent status transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// Chain membership, if this job is a unit of a composite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainLink>,
}

/// Truncates an error message to [`MAX_ERROR_LEN`] bytes on a char boundary.
#[must_use]
pub fn bounded_error(message: impl Into<String>) -> String {
    let mut message = message.into();
    if message.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

impl JobRecord {
    /// Creates a new pending record at the given instant.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        tenant_id: TenantId,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            queue: queue.into(),
            job_type: job_type.into(),
            tenant_id,
            status: JobStatus::Pending,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            last_transition_reason: None,
            chain: None,
        }
    }

    /// Sets a custom retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Marks this record as a unit of a composite chain.
    #[must_use]
    pub const fn with_chain(mut self, chain_id: ChainId, unit: usize) -> Self {
        self.chain = Some(ChainLink { chain_id, unit });
        self
    }

    /// Returns true if the job is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if a `Failed` job's backoff has elapsed at `now`.
    #[must_use]
    pub fn is_retry_due_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Failed {
            return false;
        }
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Returns true if the heartbeat lease has expired at `now`.
    ///
    /// A job is abandoned if it is `Processing` and no heartbeat landed
    /// within `lease_ttl`. A `Processing` job with no heartbeat at all is
    /// judged by `started_at` (the claim writes both, so this only happens
    /// on records mutated by hand).
    #[must_use]
    pub fn is_lease_expired_at(&self, lease_ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }

        self.last_heartbeat
            .or(self.started_at)
            .is_none_or(|seen| now - seen > lease_ttl)
    }

    /// Returns true if a pending job was never claimed and has exceeded the
    /// max-age threshold at `now`.
    #[must_use]
    pub fn is_unclaimed_past(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.started_at.is_none()
            && self.last_heartbeat.is_none()
            && now - self.created_at > max_age
    }

    /// Returns true if one more failure would exhaust the retry budget.
    #[must_use]
    pub const fn budget_exhausted_by_next_failure(&self) -> bool {
        self.retry_count + 1 > self.max_retries
    }

    /// Records a heartbeat at the given instant.
    pub fn record_heartbeat_at(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
        self.updated_at = now;
    }

    /// Transitions to a new status with an explicit reason.
    ///
    /// Timestamp bookkeeping follows the transition:
    /// - to `Processing`: sets `started_at` on first claim and refreshes the
    ///   heartbeat
    /// - to `Done` / `DeadLetter`: sets `completed_at`
    /// - `Failed` -> `Pending` (retry promotion): clears `error` and
    ///   `retry_at`
    /// - `DeadLetter` -> `Pending` (manual requeue): resets `retry_count`
    ///   and clears `error`
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(job_id = %self.id, queue = %self.queue, from = %self.status, to = %target, reason = %reason)
    )]
    pub fn transition_to(
        &mut self,
        target: JobStatus,
        reason: TransitionReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("transition not allowed for reason {reason}"),
            });
        }

        match (self.status, target) {
            (_, JobStatus::Processing) => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.last_heartbeat = Some(now);
            }
            (_, JobStatus::Done | JobStatus::DeadLetter) => {
                self.completed_at = Some(now);
            }
            (JobStatus::Failed, JobStatus::Pending) => {
                self.error = None;
                self.retry_at = None;
            }
            (JobStatus::DeadLetter, JobStatus::Pending) => {
                self.retry_count = 0;
                self.error = None;
                self.retry_at = None;
                self.completed_at = None;
            }
            _ => {}
        }

        self.status = target;
        self.last_transition_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Records a step failure, incrementing the retry counter and routing to
    /// `Failed` (budget remains) or `DeadLetter` (budget exhausted).
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not `Processing`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let exhausted = self.budget_exhausted_by_next_failure();
        let (target, reason) = if exhausted {
            (JobStatus::DeadLetter, TransitionReason::RetriesExhausted)
        } else {
            (JobStatus::Failed, TransitionReason::StepFailed)
        };

        self.transition_to(target, reason, now)?;
        self.retry_count += 1;
        self.error = Some(bounded_error(error));
        self.retry_at = (!exhausted).then_some(retry_at);
        Ok(target)
    }

    /// Records a successful completion with its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not `Processing`.
    pub fn record_completion(&mut self, result: Value, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Done, TransitionReason::StepSucceeded, now)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }
}
