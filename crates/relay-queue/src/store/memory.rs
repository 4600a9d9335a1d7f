//! In-memory store implementation.
//!
//! This module provides [`InMemoryJobStore`], an implementation of the
//! [`JobStore`] trait backed by `RwLock`-protected maps. Every mutation runs
//! under a single write lock, which gives the conditional updates their
//! atomicity.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Suitable for tests, development, and the single-process service binary; a
//! durable backend lives behind the same trait.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use relay_core::{ChainId, JobId, TenantId};

use super::{CasResult, ClaimOutcome, FailureOutcome, JobStore, SweepOutcome};
use crate::chain::ChainPlan;
use crate::error::{Error, Result};
use crate::events::{JobEvent, JobEventKind};
use crate::executor::Progress;
use crate::job::{bounded_error, JobRecord, JobStatus, TransitionReason};

/// One logical job table plus its event trails.
#[derive(Debug, Default)]
struct QueueTable {
    jobs: HashMap<JobId, JobRecord>,
    events: HashMap<JobId, Vec<JobEvent>>,
}

impl QueueTable {
    fn append_event(
        &mut self,
        job_id: JobId,
        kind: JobEventKind,
        status: JobStatus,
        progress: Option<Progress>,
        now: DateTime<Utc>,
    ) {
        let trail = self.events.entry(job_id).or_default();
        let seq = trail.len() as u64 + 1;
        trail.push(JobEvent::new(seq, job_id, kind, status, now).with_progress(progress));
    }
}

#[derive(Debug, Default)]
struct Shared {
    queues: HashMap<String, QueueTable>,
    chains: HashMap<ChainId, ChainPlan>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

fn tenant_matches(job: &JobRecord, tenant: Option<&TenantId>) -> bool {
    tenant.is_none_or(|t| job.tenant_id == *t)
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Shared>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs currently stored across all queues.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_count(&self) -> Result<usize> {
        let count = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.queues.values().map(|table| table.jobs.len()).sum()
        };
        Ok(count)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: JobRecord) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let table = inner.queues.entry(job.queue.clone()).or_default();

        if table.jobs.contains_key(&job.id) {
            return Err(Error::storage(format!("duplicate job id {}", job.id)));
        }

        table.append_event(
            job.id,
            JobEventKind::Enqueued,
            job.status,
            None,
            job.created_at,
        );
        table.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobRecord>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .queues
                .get(queue)
                .and_then(|table| table.jobs.get(id))
                .cloned()
        };
        Ok(result)
    }

    async fn claim_next(
        &self,
        queue: &str,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        // Oldest first; id breaks created_at ties deterministically.
        let candidate = table
            .jobs
            .values()
            .filter(|job| job.status.is_claimable() && tenant_matches(job, tenant))
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = table
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::storage("claimed job vanished"))?;
        job.transition_to(JobStatus::Processing, TransitionReason::Claimed, now)?;
        let claimed = job.clone();
        table.append_event(id, JobEventKind::Claimed, JobStatus::Processing, None, now);
        Ok(Some(claimed))
    }

    async fn claim_explicit(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(ClaimOutcome::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        match job.status {
            JobStatus::Pending | JobStatus::Stale => {
                job.transition_to(JobStatus::Processing, TransitionReason::Claimed, now)?;
                let claimed = job.clone();
                table.append_event(*id, JobEventKind::Claimed, JobStatus::Processing, None, now);
                Ok(ClaimOutcome::Claimed(claimed))
            }
            // Resume of a job deliberately left holding its lease mid-chain.
            JobStatus::Processing => {
                job.record_heartbeat_at(now);
                let claimed = job.clone();
                table.append_event(*id, JobEventKind::Claimed, JobStatus::Processing, None, now);
                Ok(ClaimOutcome::Claimed(claimed))
            }
            status => Ok(ClaimOutcome::NotClaimable { status }),
        }
    }

    async fn record_heartbeat(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(job) = inner
            .queues
            .get_mut(queue)
            .and_then(|table| table.jobs.get_mut(id))
        else {
            return Ok(CasResult::NotFound);
        };

        if job.status != JobStatus::Processing {
            return Ok(CasResult::StatusMismatch { actual: job.status });
        }

        job.record_heartbeat_at(now);
        Ok(CasResult::Success)
    }

    async fn write_continue(
        &self,
        queue: &str,
        id: &JobId,
        payload: Value,
        yield_to_queue: bool,
        progress: Option<Progress>,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(CasResult::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(CasResult::NotFound);
        };

        if job.status != JobStatus::Processing {
            return Ok(CasResult::StatusMismatch { actual: job.status });
        }

        job.payload = payload;
        if yield_to_queue {
            job.transition_to(JobStatus::Pending, TransitionReason::StepYielded, now)?;
        } else {
            job.record_heartbeat_at(now);
            job.last_transition_reason = Some(TransitionReason::StepContinued);
        }
        let status = job.status;
        table.append_event(
            *id,
            JobEventKind::StepCompleted {
                yielded: yield_to_queue,
            },
            status,
            progress,
            now,
        );
        Ok(CasResult::Success)
    }

    async fn write_done(
        &self,
        queue: &str,
        id: &JobId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(CasResult::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(CasResult::NotFound);
        };

        if job.status != JobStatus::Processing {
            return Ok(CasResult::StatusMismatch { actual: job.status });
        }

        job.record_completion(result, now)?;
        table.append_event(*id, JobEventKind::Completed, JobStatus::Done, None, now);
        Ok(CasResult::Success)
    }

    async fn write_failure(
        &self,
        queue: &str,
        id: &JobId,
        error: String,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(FailureOutcome::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(FailureOutcome::NotFound);
        };

        if job.status != JobStatus::Processing {
            return Ok(FailureOutcome::StatusMismatch { actual: job.status });
        }

        let target = job.record_failure(error.clone(), retry_at, now)?;
        let retry_count = job.retry_count;
        let error = bounded_error(error);
        match target {
            JobStatus::DeadLetter => {
                table.append_event(
                    *id,
                    JobEventKind::DeadLettered { error },
                    JobStatus::DeadLetter,
                    None,
                    now,
                );
                Ok(FailureOutcome::DeadLettered)
            }
            _ => {
                table.append_event(
                    *id,
                    JobEventKind::Failed { error, retry_count },
                    JobStatus::Failed,
                    None,
                    now,
                );
                Ok(FailureOutcome::Retrying { retry_at })
            }
        }
    }

    async fn promote_due_retries(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let due: Vec<JobId> = table
            .jobs
            .values()
            .filter(|job| job.is_retry_due_at(now))
            .map(|job| job.id)
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = table.jobs.get_mut(&id) {
                job.transition_to(JobStatus::Pending, TransitionReason::RetryDue, now)?;
                promoted.push(id);
            }
        }
        Ok(promoted)
    }

    async fn expired_leases(
        &self,
        queue: &str,
        lease_ttl: Duration,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.queues.get(queue).map_or_else(Vec::new, |table| {
                table
                    .jobs
                    .values()
                    .filter(|job| {
                        job.is_lease_expired_at(lease_ttl, now) && tenant_matches(job, tenant)
                    })
                    .cloned()
                    .collect()
            })
        };
        Ok(result)
    }

    async fn unclaimed_pending(
        &self,
        queue: &str,
        max_age: Duration,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.queues.get(queue).map_or_else(Vec::new, |table| {
                table
                    .jobs
                    .values()
                    .filter(|job| job.is_unclaimed_past(max_age, now) && tenant_matches(job, tenant))
                    .cloned()
                    .collect()
            })
        };
        Ok(result)
    }

    async fn reclaim_expired(
        &self,
        queue: &str,
        id: &JobId,
        observed_heartbeat: Option<DateTime<Utc>>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(SweepOutcome::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(SweepOutcome::NotFound);
        };

        // A live worker that heartbeat between scan and correction wins, and
        // a competing reconciler that already reclaimed the job wins.
        if job.status != JobStatus::Processing || job.last_heartbeat != observed_heartbeat {
            return Ok(SweepOutcome::Skipped);
        }

        let error = bounded_error(error);
        if job.budget_exhausted_by_next_failure() {
            job.transition_to(JobStatus::DeadLetter, TransitionReason::RetriesExhausted, now)?;
            job.retry_count += 1;
            job.error = Some(error.clone());
            table.append_event(
                *id,
                JobEventKind::DeadLettered { error },
                JobStatus::DeadLetter,
                None,
                now,
            );
            Ok(SweepOutcome::DeadLettered)
        } else {
            // Payload is preserved as-is: the next claim resumes from the
            // last written partial state. The retry is immediately claimable.
            job.transition_to(JobStatus::Pending, TransitionReason::LeaseExpired, now)?;
            job.retry_count += 1;
            job.error = Some(error.clone());
            job.retry_at = None;
            table.append_event(
                *id,
                JobEventKind::Reclaimed { error },
                JobStatus::Pending,
                None,
                now,
            );
            Ok(SweepOutcome::Requeued)
        }
    }

    async fn flag_stale_pending(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(SweepOutcome::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(SweepOutcome::NotFound);
        };

        // Applies only to a still-pending job that was never claimed; a
        // concurrent claim between scan and correction wins.
        if job.status != JobStatus::Pending
            || job.started_at.is_some()
            || job.last_heartbeat.is_some()
        {
            return Ok(SweepOutcome::Skipped);
        }

        if job.budget_exhausted_by_next_failure() {
            job.transition_to(JobStatus::DeadLetter, TransitionReason::RetriesExhausted, now)?;
            job.retry_count += 1;
            let error = bounded_error("stale: never claimed");
            job.error = Some(error.clone());
            table.append_event(
                *id,
                JobEventKind::DeadLettered { error },
                JobStatus::DeadLetter,
                None,
                now,
            );
            Ok(SweepOutcome::DeadLettered)
        } else {
            job.transition_to(JobStatus::Stale, TransitionReason::NeverClaimed, now)?;
            job.retry_count += 1;
            table.append_event(*id, JobEventKind::FlaggedStale, JobStatus::Stale, None, now);
            Ok(SweepOutcome::FlaggedStale)
        }
    }

    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(table) = inner.queues.get_mut(queue) else {
            return Ok(CasResult::NotFound);
        };
        let Some(job) = table.jobs.get_mut(id) else {
            return Ok(CasResult::NotFound);
        };

        if job.status != JobStatus::DeadLetter {
            return Ok(CasResult::StatusMismatch { actual: job.status });
        }

        job.transition_to(JobStatus::Pending, TransitionReason::ManualRequeue, now)?;
        table.append_event(*id, JobEventKind::Requeued, JobStatus::Pending, None, now);
        Ok(CasResult::Success)
    }

    async fn events(
        &self,
        queue: &str,
        id: &JobId,
        limit: Option<usize>,
    ) -> Result<Vec<JobEvent>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            let trail = inner
                .queues
                .get(queue)
                .and_then(|table| table.events.get(id))
                .cloned()
                .unwrap_or_default();

            match limit {
                Some(limit) if trail.len() > limit => trail[trail.len() - limit..].to_vec(),
                _ => trail,
            }
        };
        Ok(result)
    }

    async fn put_chain(&self, plan: ChainPlan) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.chains.insert(plan.chain_id, plan);
        Ok(())
    }

    async fn get_chain(&self, chain_id: &ChainId) -> Result<Option<ChainPlan>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.chains.get(chain_id).cloned()
        };
        Ok(result)
    }

    async fn set_chaining(&self, chain_id: &ChainId, enabled: bool) -> Result<ChainPlan> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let plan = inner
            .chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound {
                chain_id: *chain_id,
            })?;
        plan.chaining_enabled = enabled;
        plan.updated_at = Utc::now();
        Ok(plan.clone())
    }

    async fn bind_unit_job(&self, chain_id: &ChainId, unit: usize, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let plan = inner
            .chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound {
                chain_id: *chain_id,
            })?;

        let slot = plan.unit_jobs.get_mut(unit).ok_or_else(|| {
            Error::storage(format!("chain {chain_id} has no unit {unit}"))
        })?;
        match slot {
            Some(existing) if *existing != job_id => Err(Error::storage(format!(
                "chain {chain_id} unit {unit} already bound to {existing}"
            ))),
            _ => {
                *slot = Some(job_id);
                plan.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn queue_depths(&self) -> Result<Vec<(String, usize)>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .queues
                .iter()
                .map(|(name, table)| {
                    let depth = table.jobs.values().filter(|job| !job.is_terminal()).count();
                    (name.clone(), depth)
                })
                .collect()
        };
        Ok(result)
    }
}
