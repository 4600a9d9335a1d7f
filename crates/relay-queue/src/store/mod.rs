//! Pluggable storage for job records, event trails, and chain control rows.
//!
//! The `JobStore` trait defines the persistence layer. Workers and the
//! reconciler may run as independent, parallel, stateless invocations with no
//! shared memory, so every mutation is a single conditional update keyed on
//! the expected prior status (and, for reconciliation, the observed
//! heartbeat).
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Status transitions use compare-and-swap to prevent
//!   races; two concurrent claims of the same pending job see exactly one
//!   winner
//! - **Events ride the mutation**: Each mutation appends its trail entry
//!   under the same atomic update, so the trail never disagrees with the row
//! - **Testability**: In-memory implementation for tests and the
//!   single-process service; a durable backend is a deployment concern
//!   behind the same trait

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use relay_core::{ChainId, JobId, TenantId};

use crate::chain::ChainPlan;
use crate::error::Result;
use crate::events::JobEvent;
use crate::executor::Progress;
use crate::job::{JobRecord, JobStatus};

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Job not found.
    NotFound,
    /// Status didn't match the expected value.
    StatusMismatch {
        /// The actual status that was found.
        actual: JobStatus,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of an explicit claim by job id.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The claim succeeded; the returned record is `Processing`.
    Claimed(JobRecord),
    /// Job not found.
    NotFound,
    /// The job's status does not admit a claim.
    NotClaimable {
        /// The status the job actually held.
        status: JobStatus,
    },
}

/// Where a recorded failure routed the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Budget remains; the job waits out its backoff in `Failed`.
    Retrying {
        /// When the job becomes claimable again.
        retry_at: DateTime<Utc>,
    },
    /// Budget exhausted; the job is dead-lettered.
    DeadLettered,
    /// Job not found.
    NotFound,
    /// The job was not `Processing`.
    StatusMismatch {
        /// The actual status that was found.
        actual: JobStatus,
    },
}

/// Result of one reconciler correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Lease-expired job returned to `Pending`.
    Requeued,
    /// Never-claimed pending job flagged `Stale`.
    FlaggedStale,
    /// Budget exhausted; the job is dead-lettered.
    DeadLettered,
    /// Job not found.
    NotFound,
    /// The job moved since it was scanned (live worker or concurrent
    /// reconciler won); nothing was changed.
    Skipped,
}

/// Storage abstraction for queue state.
///
/// ## CAS Semantics
///
/// The claim and write-back methods are the core primitives for distributed
/// correctness:
/// - `claim_next` prevents double-claims (P1)
/// - `reclaim_expired` keys on the observed heartbeat so two concurrent
///   reconcilers cannot double-increment `retry_count` (P2), and a live
///   worker that heartbeats between scan and correction wins (P4)
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// worker and reconciler invocations.
#[async_trait]
pub trait JobStore: Send + Sync {
    // --- Record operations ---

    /// Inserts a new job record.
    ///
    /// Appends the `Enqueued` trail entry under the same update. The record
    /// is visible to reads as soon as this returns.
    async fn insert(&self, job: JobRecord) -> Result<()>;

    /// Gets a job by id.
    ///
    /// Returns `None` if the job does not exist.
    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>>;

    // --- Claim operations (CAS) ---

    /// Claims the oldest eligible job in the queue, if any.
    ///
    /// Eligible means `Pending` or `Stale`, oldest `created_at` first
    /// (best-effort fairness, not strict FIFO). Atomically transitions the
    /// job to `Processing`, setting `started_at` on first claim and
    /// refreshing the heartbeat.
    async fn claim_next(
        &self,
        queue: &str,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Claims a specific job by id (resume semantics).
    ///
    /// Accepts `Pending` and `Stale` jobs like `claim_next`, and also
    /// re-enters a `Processing` job that a previous invocation deliberately
    /// left holding its lease mid-chain; re-entry refreshes the heartbeat.
    async fn claim_explicit(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Refreshes the heartbeat lease of a `Processing` job.
    async fn record_heartbeat(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    // --- Step write-back operations (CAS on `Processing`) ---

    /// Writes an updated payload after a `Continue` outcome.
    ///
    /// When `yield_to_queue` is true the job returns to `Pending` so a
    /// different invocation picks it up; otherwise it stays `Processing`
    /// with a refreshed heartbeat.
    async fn write_continue(
        &self,
        queue: &str,
        id: &JobId,
        payload: Value,
        yield_to_queue: bool,
        progress: Option<Progress>,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    /// Writes the result and completes the job.
    async fn write_done(
        &self,
        queue: &str,
        id: &JobId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    /// Records a step failure, incrementing `retry_count` and routing to
    /// `Failed` (with the given backoff deadline) or `DeadLetter`.
    async fn write_failure(
        &self,
        queue: &str,
        id: &JobId,
        error: String,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome>;

    // --- Retry promotion ---

    /// Promotes `Failed` jobs whose backoff has elapsed back to `Pending`.
    ///
    /// Returns the promoted ids. Idempotent: a job is promoted at most once
    /// per failure.
    async fn promote_due_retries(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    // --- Reconciler scan queries (read-only) ---

    /// Returns `Processing` jobs whose heartbeat lease has expired.
    async fn expired_leases(
        &self,
        queue: &str,
        lease_ttl: Duration,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    /// Returns `Pending` jobs that were never claimed and exceed the max-age
    /// threshold.
    async fn unclaimed_pending(
        &self,
        queue: &str,
        max_age: Duration,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    // --- Reconciler corrections (CAS) ---

    /// Reclaims a lease-expired `Processing` job.
    ///
    /// The update applies only if the job is still `Processing` with
    /// `last_heartbeat` equal to `observed_heartbeat`; any concurrent
    /// heartbeat or competing reconciler makes this a `Skipped` no-op.
    /// Consumes one retry unit and routes to `Pending` (payload preserved,
    /// synthetic error recorded, immediately claimable) or `DeadLetter`.
    async fn reclaim_expired(
        &self,
        queue: &str,
        id: &JobId,
        observed_heartbeat: Option<DateTime<Utc>>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome>;

    /// Flags a never-claimed `Pending` job as `Stale`.
    ///
    /// Applies only if the job is still `Pending` with no claim recorded.
    /// Consumes one retry unit under the same budget as failures; routes to
    /// `DeadLetter` when the budget is exhausted. `Stale` jobs remain
    /// claimable.
    async fn flag_stale_pending(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome>;

    // --- Operator actions ---

    /// Manually requeues a dead-lettered job: resets `retry_count`, clears
    /// `error`, sets `Pending`. Any other status is a `StatusMismatch`.
    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    // --- Event trail ---

    /// Returns the job's event trail in ascending sequence order.
    ///
    /// With a limit, returns the most recent `limit` entries (still
    /// ascending).
    async fn events(&self, queue: &str, id: &JobId, limit: Option<usize>)
        -> Result<Vec<JobEvent>>;

    // --- Chain control records ---

    /// Stores a chain control record (insert or replace).
    async fn put_chain(&self, plan: ChainPlan) -> Result<()>;

    /// Gets a chain control record.
    async fn get_chain(&self, chain_id: &ChainId) -> Result<Option<ChainPlan>>;

    /// Sets the chaining gate and returns the updated plan.
    async fn set_chaining(&self, chain_id: &ChainId, enabled: bool) -> Result<ChainPlan>;

    /// Binds an enqueued job to a chain unit.
    async fn bind_unit_job(&self, chain_id: &ChainId, unit: usize, job_id: JobId) -> Result<()>;

    // --- Metrics support ---

    /// Returns `(queue, depth)` pairs counting non-terminal jobs.
    async fn queue_depths(&self) -> Result<Vec<(String, usize)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::StatusMismatch {
            actual: JobStatus::Processing
        }
        .is_success());
    }
}
