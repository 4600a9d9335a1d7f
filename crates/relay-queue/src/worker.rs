//! The worker: one bounded claim/execute/write-back pass.
//!
//! A worker invocation is short-lived and stateless; many may run in
//! parallel across processes with no shared memory. Each pass performs at
//! most one step of business logic, which bounds wall-clock duration per
//! invocation. Long multi-stage work is expressed as a job that repeatedly
//! yields back to the queue and is re-invoked, never as one long-running
//! call.
//!
//! Coroutine-like suspension is modeled explicitly: a `Continue` outcome
//! returns updated state to durable storage and exits; a future, independent
//! invocation picks up where the payload left off.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use relay_core::JobId;

use crate::chain::ChainController;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::executor::{ContinuationStyle, Registry, StepContext, StepOutcome};
use crate::job::JobRecord;
use crate::metrics::QueueMetrics;
use crate::store::{CasResult, ClaimOutcome, FailureOutcome, JobStore};

/// What a pass did with the job it claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum StepDisposition {
    /// Step yielded more work; the job holds its lease or went back to the
    /// queue.
    Continued {
        /// True if the job was returned to `Pending`.
        yielded: bool,
    },
    /// The job completed.
    Completed,
    /// The step failed; the job waits out its backoff.
    Failed {
        /// Retry attempts consumed so far.
        retry_count: u32,
    },
    /// The step failed and the retry budget ran out.
    DeadLettered,
    /// The write-back found the job no longer `Processing` (the reconciler
    /// reclaimed it mid-step); nothing was changed.
    LeaseLost,
}

/// The job a pass processed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedJob {
    /// The claimed job.
    pub job_id: JobId,
    /// Its type tag.
    pub job_type: String,
    /// What happened to it.
    #[serde(flatten)]
    pub disposition: StepDisposition,
}

/// Summary of one worker pass, returned to the trigger caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    /// The queue the pass ran against.
    pub queue: String,
    /// `Failed` jobs promoted back to `Pending` before claiming.
    pub promoted_retries: Vec<JobId>,
    /// The processed job, if one was claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<ProcessedJob>,
}

/// Stateless execution unit: claims one job, runs one step, writes back.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    registry: Registry,
    chains: ChainController,
    config: QueueConfig,
    metrics: QueueMetrics,
}

impl Worker {
    /// Creates a worker over the given store, registry, and chain
    /// controller.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Registry,
        chains: ChainController,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            chains,
            config,
            metrics: QueueMetrics::new(),
        }
    }

    /// Performs a single bounded pass against a queue.
    ///
    /// With a `target`, force-resumes that specific job instead of claiming
    /// the oldest eligible one.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (store access). In
    /// that case no status transition was written by this pass, so the job
    /// stays eligible for a future claim, or the lease expiry covers it.
    #[tracing::instrument(skip(self), fields(queue = queue, target = ?target))]
    pub async fn run_pass(&self, queue: &str, target: Option<JobId>) -> Result<PassSummary> {
        let now = Utc::now();
        let promoted_retries = self.store.promote_due_retries(queue, now).await?;
        for _ in &promoted_retries {
            self.metrics.record_transition("failed", "pending");
        }

        let claimed = match target {
            Some(id) => match self.store.claim_explicit(queue, &id, now).await? {
                ClaimOutcome::Claimed(job) => Some(job),
                ClaimOutcome::NotFound => {
                    tracing::warn!(job_id = %id, "target job not found");
                    None
                }
                ClaimOutcome::NotClaimable { status } => {
                    tracing::info!(job_id = %id, status = %status, "target job not claimable");
                    None
                }
            },
            None => self.store.claim_next(queue, None, now).await?,
        };

        let processed = match claimed {
            Some(job) => {
                self.metrics.record_transition("pending", "processing");
                Some(self.execute_step(queue, job).await?)
            }
            None => None,
        };

        for (name, depth) in self.store.queue_depths().await? {
            self.metrics.set_queue_depth(&name, depth);
        }

        Ok(PassSummary {
            queue: queue.to_string(),
            promoted_retries,
            processed,
        })
    }

    /// Executes one step of a claimed job and writes the outcome back.
    async fn execute_step(&self, queue: &str, job: JobRecord) -> Result<ProcessedJob> {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let Ok(executor) = self.registry.get(&job_type) else {
            // The type was registered at enqueue time but is gone now; burn a
            // retry unit rather than leaving the job stuck in Processing.
            tracing::error!(job_id = %job_id, job_type = %job_type, "no executor registered");
            let disposition = self
                .write_failure(queue, &job, format!("no executor registered for {job_type}"))
                .await?;
            return Ok(ProcessedJob {
                job_id,
                job_type,
                disposition,
            });
        };

        let ctx = StepContext {
            job_id,
            queue: queue.to_string(),
            tenant_id: job.tenant_id.clone(),
            retry_count: job.retry_count,
        };
        let payload = job.payload.clone();

        let timer = std::time::Instant::now();
        // The step runs on its own task so a panic is harvested as a Failed
        // outcome instead of unwinding through the pass and leaving the job
        // stuck in Processing.
        let step_task = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.step(&ctx, payload).await })
        };
        let outcome = match step_task.await {
            Ok(outcome) => outcome,
            Err(join_error) => StepOutcome::Failed {
                error: format!("step aborted: {join_error}"),
            },
        };
        self.metrics.observe_step_duration(queue, timer.elapsed());

        let now = Utc::now();
        let disposition = match outcome {
            StepOutcome::Continue { payload, progress } => {
                let yielded = executor.continuation() == ContinuationStyle::YieldToQueue;
                let result = self
                    .store
                    .write_continue(queue, &job_id, payload, yielded, progress, now)
                    .await?;
                self.metrics.record_step(queue, "continue");
                match result {
                    CasResult::Success => {
                        if yielded {
                            self.metrics.record_transition("processing", "pending");
                        }
                        StepDisposition::Continued { yielded }
                    }
                    _ => StepDisposition::LeaseLost,
                }
            }
            StepOutcome::Done { result } => {
                let write = self.store.write_done(queue, &job_id, result, now).await?;
                self.metrics.record_step(queue, "done");
                match write {
                    CasResult::Success => {
                        self.metrics.record_transition("processing", "done");
                        if let Some(link) = job.chain {
                            // Chain advancement failing must not un-complete
                            // the job; it surfaces in logs and the next
                            // resume() retries it.
                            if let Err(error) = self.chains.advance(&link.chain_id).await {
                                tracing::error!(
                                    chain_id = %link.chain_id,
                                    %error,
                                    "chain advance failed after unit completion"
                                );
                            }
                        }
                        StepDisposition::Completed
                    }
                    _ => StepDisposition::LeaseLost,
                }
            }
            StepOutcome::Failed { error } => {
                self.metrics.record_step(queue, "failed");
                self.write_failure(queue, &job, error).await?
            }
        };

        tracing::info!(job_id = %job_id, job_type = %job_type, ?disposition, "pass complete");
        Ok(ProcessedJob {
            job_id,
            job_type,
            disposition,
        })
    }

    /// Records a failure with the backoff policy applied.
    async fn write_failure(
        &self,
        queue: &str,
        job: &JobRecord,
        error: String,
    ) -> Result<StepDisposition> {
        let now = Utc::now();
        let retry_at = self.config.backoff.retry_at(job.retry_count + 1, now);
        let outcome = self
            .store
            .write_failure(queue, &job.id, error, retry_at, now)
            .await?;

        Ok(match outcome {
            FailureOutcome::Retrying { .. } => {
                self.metrics.record_transition("processing", "failed");
                StepDisposition::Failed {
                    retry_count: job.retry_count + 1,
                }
            }
            FailureOutcome::DeadLettered => {
                self.metrics.record_transition("processing", "dead_letter");
                self.metrics.record_dead_letter(queue);
                StepDisposition::DeadLettered
            }
            FailureOutcome::NotFound | FailureOutcome::StatusMismatch { .. } => {
                StepDisposition::LeaseLost
            }
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::enqueue::{EnqueueRequest, Enqueuer};
    use crate::executor::{Progress, StepExecutor};
    use crate::job::JobStatus;
    use crate::store::memory::InMemoryJobStore;
    use async_trait::async_trait;
    use relay_core::TenantId;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "course-jobs";

    /// Counts down `steps_remaining` Continue outcomes, then completes.
    struct CountdownExecutor {
        hold_lease: bool,
    }

    #[async_trait]
    impl StepExecutor for CountdownExecutor {
        async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
            let remaining = payload
                .get("stepsRemaining")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if remaining == 0 {
                StepOutcome::Done {
                    result: json!({"finished": true}),
                }
            } else {
                StepOutcome::Continue {
                    payload: json!({"stepsRemaining": remaining - 1}),
                    progress: Some(Progress::stage(format!("remaining-{remaining}"))),
                }
            }
        }

        fn continuation(&self) -> ContinuationStyle {
            if self.hold_lease {
                ContinuationStyle::HoldLease
            } else {
                ContinuationStyle::YieldToQueue
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl StepExecutor for AlwaysFails {
        async fn step(&self, _ctx: &StepContext, _payload: Value) -> StepOutcome {
            StepOutcome::Failed {
                error: "synthetic failure".into(),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl StepExecutor for Panics {
        async fn step(&self, _ctx: &StepContext, _payload: Value) -> StepOutcome {
            panic!("executor bug");
        }
    }

    struct CountsCalls {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepExecutor for CountsCalls {
        async fn step(&self, _ctx: &StepContext, _payload: Value) -> StepOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StepOutcome::Done {
                result: json!({}),
            }
        }
    }

    fn tenant() -> TenantId {
        TenantId::new_unchecked("acme-academy")
    }

    fn harness(registry: Registry) -> (Arc<InMemoryJobStore>, Enqueuer, Worker) {
        let store: Arc<InMemoryJobStore> = Arc::new(InMemoryJobStore::new());
        let store_dyn: Arc<dyn JobStore> = store.clone();
        let enqueuer = Enqueuer::new(store_dyn.clone(), registry.clone());
        let chains = ChainController::new(store_dyn.clone(), enqueuer.clone());
        let config = QueueConfig {
            backoff: BackoffPolicy::none(),
            ..QueueConfig::default()
        };
        let worker = Worker::new(store_dyn, registry, chains, config);
        (store, enqueuer, worker)
    }

    #[tokio::test]
    async fn empty_queue_yields_empty_pass() {
        let (_store, _enqueuer, worker) = harness(Registry::new());
        let summary = worker.run_pass(QUEUE, None).await.unwrap();
        assert!(summary.processed.is_none());
        assert!(summary.promoted_retries.is_empty());
    }

    #[tokio::test]
    async fn continue_yields_back_to_queue() {
        let mut registry = Registry::new();
        registry.register(
            "countdown",
            Arc::new(CountdownExecutor { hold_lease: false }),
        );
        let (store, enqueuer, worker) = harness(registry);

        let id = enqueuer
            .enqueue(EnqueueRequest::new(
                QUEUE,
                "countdown",
                tenant(),
                json!({"stepsRemaining": 2}),
            ))
            .await
            .unwrap();

        let summary = worker.run_pass(QUEUE, None).await.unwrap();
        let processed = summary.processed.unwrap();
        assert_eq!(
            processed.disposition,
            StepDisposition::Continued { yielded: true }
        );

        let job = store.get(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.payload, json!({"stepsRemaining": 1}));
    }

    #[tokio::test]
    async fn hold_lease_keeps_processing() {
        let mut registry = Registry::new();
        registry.register("countdown", Arc::new(CountdownExecutor { hold_lease: true }));
        let (store, enqueuer, worker) = harness(registry);

        let id = enqueuer
            .enqueue(EnqueueRequest::new(
                QUEUE,
                "countdown",
                tenant(),
                json!({"stepsRemaining": 1}),
            ))
            .await
            .unwrap();

        worker.run_pass(QUEUE, None).await.unwrap();
        let job = store.get(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        // A claim without a target skips the held job; the explicit resume
        // finishes it.
        let summary = worker.run_pass(QUEUE, None).await.unwrap();
        assert!(summary.processed.is_none());

        let summary = worker.run_pass(QUEUE, Some(id)).await.unwrap();
        assert_eq!(
            summary.processed.unwrap().disposition,
            StepDisposition::Completed
        );
    }

    #[tokio::test]
    async fn failure_consumes_budget_until_dead_letter() {
        let mut registry = Registry::new();
        registry.register("flaky", Arc::new(AlwaysFails));
        let (store, enqueuer, worker) = harness(registry);

        let id = enqueuer
            .enqueue(
                EnqueueRequest::new(QUEUE, "flaky", tenant(), json!({}))
                    .with_max_retries(2),
            )
            .await
            .unwrap();

        // Pass 1 and 2: failed with budget remaining.
        for expected in 1..=2u32 {
            let summary = worker.run_pass(QUEUE, None).await.unwrap();
            assert_eq!(
                summary.processed.unwrap().disposition,
                StepDisposition::Failed {
                    retry_count: expected
                }
            );
        }

        // Pass 3: budget exhausted.
        let summary = worker.run_pass(QUEUE, None).await.unwrap();
        assert_eq!(
            summary.processed.unwrap().disposition,
            StepDisposition::DeadLettered
        );

        let job = store.get(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.retry_count, 3);
    }

    #[tokio::test]
    async fn panic_is_harvested_as_failure() {
        let mut registry = Registry::new();
        registry.register("buggy", Arc::new(Panics));
        let (store, enqueuer, worker) = harness(registry);

        let id = enqueuer
            .enqueue(
                EnqueueRequest::new(QUEUE, "buggy", tenant(), json!({})).with_max_retries(0),
            )
            .await
            .unwrap();

        let summary = worker.run_pass(QUEUE, None).await.unwrap();
        assert_eq!(
            summary.processed.unwrap().disposition,
            StepDisposition::DeadLettered
        );

        // The job is never left stuck in Processing.
        let job = store.get(QUEUE, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert!(job.error.as_deref().unwrap().contains("step aborted"));
    }

    #[tokio::test]
    async fn each_pass_runs_at_most_one_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry.register(
            "counted",
            Arc::new(CountsCalls {
                calls: calls.clone(),
            }),
        );
        let (_store, enqueuer, worker) = harness(registry);

        for _ in 0..3 {
            enqueuer
                .enqueue(EnqueueRequest::new(QUEUE, "counted", tenant(), json!({})))
                .await
                .unwrap();
        }

        worker.run_pass(QUEUE, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        worker.run_pass(QUEUE, None).await.unwrap();
        worker.run_pass(QUEUE, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
