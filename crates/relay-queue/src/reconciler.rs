//! Anti-entropy sweep for jobs stuck by lease expiry or never claimed.
//!
//! The reconciler scans for work that may have been lost to:
//!
//! - Worker invocations killed by a platform timeout before write-back
//! - Worker crashes mid-step (lease expires with no further heartbeat)
//! - Enqueues that no worker ever picked up
//!
//! ## Corrections
//!
//! - Lease-expired `Processing` jobs are returned to `Pending` (payload
//!   preserved, one retry unit consumed) or dead-lettered when the budget is
//!   out
//! - Never-claimed `Pending` jobs past the max-age threshold are flagged
//!   `Stale` for operator visibility under the same budget
//!
//! ## Queue Coverage
//!
//! The sweep covers exactly the queues listed in `covered_queues` — coverage
//! is a deliberate per-queue decision, never an assumption. A queue left off
//! the list is an acknowledged operational gap until a queue-specific
//! equivalent exists.
//!
//! ## Safety
//!
//! Reconciliation is idempotent and safe to run concurrently with workers
//! and with itself: every correction is conditioned on the observed
//! heartbeat, so a live worker inside its lease window is never touched and
//! two concurrent sweeps cannot double-increment `retry_count`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_core::{JobId, TenantId};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::metrics::{QueueMetrics, TimingGuard};
use crate::store::{JobStore, SweepOutcome};

/// Synthetic error recorded on jobs reclaimed after lease expiry.
pub const STALE_LEASE_ERROR: &str = "stale: heartbeat lease expired";

/// A job the sweep corrected, with the queue it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweptJob {
    /// Queue name.
    pub queue: String,
    /// Corrected job.
    pub job_id: JobId,
}

/// Counts and ids from one reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Lease-expired jobs returned to `Pending`.
    pub requeued: Vec<SweptJob>,
    /// Jobs whose correction exhausted the retry budget.
    pub dead_lettered: Vec<SweptJob>,
    /// Never-claimed pending jobs flagged `Stale`.
    pub flagged_stale: Vec<SweptJob>,
    /// Corrections skipped because the job moved between scan and update.
    pub skipped: usize,
}

/// The sweeping process that repairs stuck queue state.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    covered_queues: BTreeSet<String>,
    config: QueueConfig,
    metrics: QueueMetrics,
}

impl Reconciler {
    /// Creates a reconciler covering the given queues.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        covered_queues: BTreeSet<String>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            covered_queues,
            config,
            metrics: QueueMetrics::new(),
        }
    }

    /// Returns the queues this reconciler covers.
    #[must_use]
    pub const fn covered_queues(&self) -> &BTreeSet<String> {
        &self.covered_queues
    }

    /// Runs one sweep across the covered queues.
    ///
    /// # Errors
    ///
    /// Returns an error if a store scan fails; corrections applied before
    /// the failure remain applied (the sweep is idempotent, so the next run
    /// finishes the work).
    pub async fn reconcile(&self, tenant: Option<&TenantId>) -> Result<ReconcileSummary> {
        self.reconcile_at(tenant, Utc::now()).await
    }

    /// Runs one sweep with an explicit clock, for tests.
    #[tracing::instrument(skip(self), fields(tenant = tenant.map(TenantId::as_str)))]
    pub async fn reconcile_at(
        &self,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let metrics = self.metrics.clone();
        let _timer = TimingGuard::new(move |duration| {
            metrics.observe_reconcile_duration(duration);
        });

        let mut summary = ReconcileSummary::default();

        for queue in &self.covered_queues {
            self.sweep_expired_leases(queue, tenant, now, &mut summary)
                .await?;
            self.sweep_unclaimed_pending(queue, tenant, now, &mut summary)
                .await?;
        }

        tracing::info!(
            requeued = summary.requeued.len(),
            dead_lettered = summary.dead_lettered.len(),
            flagged_stale = summary.flagged_stale.len(),
            skipped = summary.skipped,
            "reconcile sweep complete"
        );
        Ok(summary)
    }

    /// Reclaims `Processing` jobs whose heartbeat lease has expired.
    async fn sweep_expired_leases(
        &self,
        queue: &str,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let expired = self
            .store
            .expired_leases(queue, self.config.lease_ttl_chrono(), tenant, now)
            .await?;

        for job in expired {
            let outcome = self
                .store
                .reclaim_expired(
                    queue,
                    &job.id,
                    job.last_heartbeat,
                    STALE_LEASE_ERROR.to_string(),
                    now,
                )
                .await?;
            self.record(queue, &outcome, job.id, summary);
        }
        Ok(())
    }

    /// Flags `Pending` jobs that were never claimed within the max age.
    async fn sweep_unclaimed_pending(
        &self,
        queue: &str,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> Result<()> {
        let unclaimed = self
            .store
            .unclaimed_pending(queue, self.config.pending_max_age_chrono(), tenant, now)
            .await?;

        for job in unclaimed {
            let outcome = self.store.flag_stale_pending(queue, &job.id, now).await?;
            self.record(queue, &outcome, job.id, summary);
        }
        Ok(())
    }

    fn record(
        &self,
        queue: &str,
        outcome: &SweepOutcome,
        job_id: JobId,
        summary: &mut ReconcileSummary,
    ) {
        let swept = SweptJob {
            queue: queue.to_string(),
            job_id,
        };
        match outcome {
            SweepOutcome::Requeued => {
                self.metrics.record_reclaim(queue, "requeued");
                self.metrics.record_transition("processing", "pending");
                summary.requeued.push(swept);
            }
            SweepOutcome::DeadLettered => {
                self.metrics.record_reclaim(queue, "dead_lettered");
                self.metrics.record_dead_letter(queue);
                summary.dead_lettered.push(swept);
            }
            SweepOutcome::FlaggedStale => {
                self.metrics.record_reclaim(queue, "flagged_stale");
                self.metrics.record_transition("pending", "stale");
                summary.flagged_stale.push(swept);
            }
            SweepOutcome::Skipped | SweepOutcome::NotFound => {
                self.metrics.record_reclaim(queue, "skipped");
                summary.skipped += 1;
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("covered_queues", &self.covered_queues)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, JobStatus};
    use crate::store::memory::InMemoryJobStore;
    use chrono::Duration;
    use serde_json::json;

    const COVERED: &str = "agent-jobs";
    const UNCOVERED: &str = "media-jobs";

    fn tenant() -> TenantId {
        TenantId::new_unchecked("acme-academy")
    }

    fn reconciler(store: Arc<InMemoryJobStore>) -> Reconciler {
        let covered = BTreeSet::from([COVERED.to_string()]);
        Reconciler::new(store, covered, QueueConfig::default())
    }

    async fn insert_job(store: &InMemoryJobStore, queue: &str) -> JobRecord {
        let job = JobRecord::new(queue, "demo", tenant(), json!({"step": 3}), Utc::now());
        store.insert(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn reclaims_expired_lease_with_stale_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, COVERED).await;
        let claimed_at = Utc::now();
        store
            .claim_next(COVERED, None, claimed_at)
            .await
            .unwrap()
            .unwrap();

        let reconciler = reconciler(store.clone());

        // Inside the lease window: untouched.
        let summary = reconciler
            .reconcile_at(None, claimed_at + Duration::seconds(30))
            .await
            .unwrap();
        assert!(summary.requeued.is_empty());

        // Past the lease TTL: requeued with retry_count 1.
        let later = claimed_at + Duration::seconds(700);
        let summary = reconciler.reconcile_at(None, later).await.unwrap();
        assert_eq!(summary.requeued.len(), 1);
        assert_eq!(summary.requeued[0].job_id, job.id);

        let record = store.get(COVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.error.as_deref().unwrap().contains("stale"));
        // Payload untouched: resume from last written partial state.
        assert_eq!(record.payload, json!({"step": 3}));
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_double_count() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, COVERED).await;
        let claimed_at = Utc::now();
        store.claim_next(COVERED, None, claimed_at).await.unwrap();

        let reconciler = reconciler(store.clone());
        let later = claimed_at + Duration::seconds(700);

        reconciler.reconcile_at(None, later).await.unwrap();
        // The job is now Pending; a second sweep finds nothing to reclaim.
        let summary = reconciler.reconcile_at(None, later).await.unwrap();
        assert!(summary.requeued.is_empty());
        assert_eq!(summary.skipped, 0);

        let record = store.get(COVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn dead_letters_when_budget_exhausted() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut job = JobRecord::new(COVERED, "demo", tenant(), json!({}), Utc::now());
        job.max_retries = 0;
        store.insert(job.clone()).await.unwrap();
        let claimed_at = Utc::now();
        store.claim_next(COVERED, None, claimed_at).await.unwrap();

        let reconciler = reconciler(store.clone());
        let summary = reconciler
            .reconcile_at(None, claimed_at + Duration::seconds(700))
            .await
            .unwrap();

        assert_eq!(summary.dead_lettered.len(), 1);
        let record = store.get(COVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::DeadLetter);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn flags_never_claimed_pending() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, COVERED).await;

        let reconciler = reconciler(store.clone());
        let later = job.created_at + Duration::seconds(4000);
        let summary = reconciler.reconcile_at(None, later).await.unwrap();

        assert_eq!(summary.flagged_stale.len(), 1);
        let record = store.get(COVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Stale);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn uncovered_queues_are_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, UNCOVERED).await;
        let claimed_at = Utc::now();
        store.claim_next(UNCOVERED, None, claimed_at).await.unwrap();

        let reconciler = reconciler(store.clone());
        let summary = reconciler
            .reconcile_at(None, claimed_at + Duration::seconds(7000))
            .await
            .unwrap();

        assert!(summary.requeued.is_empty());
        assert!(summary.dead_lettered.is_empty());

        // The uncovered queue's job stays stuck: an acknowledged gap.
        let record = store.get(UNCOVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn tenant_scope_limits_the_sweep() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, COVERED).await;
        let claimed_at = Utc::now();
        store.claim_next(COVERED, None, claimed_at).await.unwrap();

        let reconciler = reconciler(store.clone());
        let other = TenantId::new_unchecked("other-org");
        let later = claimed_at + Duration::seconds(700);

        let summary = reconciler.reconcile_at(Some(&other), later).await.unwrap();
        assert!(summary.requeued.is_empty());

        let summary = reconciler
            .reconcile_at(Some(&tenant()), later)
            .await
            .unwrap();
        assert_eq!(summary.requeued.len(), 1);
        assert_eq!(summary.requeued[0].job_id, job.id);
    }

    #[tokio::test]
    async fn live_worker_within_lease_is_never_touched() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = insert_job(&store, COVERED).await;
        let claimed_at = Utc::now();
        store.claim_next(COVERED, None, claimed_at).await.unwrap();

        // Worker keeps heartbeating.
        let recent = claimed_at + Duration::seconds(650);
        store
            .record_heartbeat(COVERED, &job.id, recent)
            .await
            .unwrap();

        let reconciler = reconciler(store.clone());
        let summary = reconciler
            .reconcile_at(None, claimed_at + Duration::seconds(700))
            .await
            .unwrap();

        assert!(summary.requeued.is_empty());
        let record = store.get(COVERED, &job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.retry_count, 0);
    }
}
