//! End-to-end lifecycle tests: retry budgets, crash recovery, chaining,
//! claim races, and the multi-step yield/resume protocol.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use relay_core::TenantId;
use relay_queue::chain::{ChainController, ChainUnit};
use relay_queue::config::{BackoffPolicy, QueueConfig};
use relay_queue::enqueue::{EnqueueRequest, Enqueuer};
use relay_queue::events::JobEventKind;
use relay_queue::executor::{Progress, Registry, StepContext, StepExecutor, StepOutcome};
use relay_queue::job::JobStatus;
use relay_queue::reconciler::Reconciler;
use relay_queue::store::memory::InMemoryJobStore;
use relay_queue::store::{CasResult, JobStore};
use relay_queue::worker::{StepDisposition, Worker};

const QUEUE: &str = "course-jobs";

struct AlwaysFails;

#[async_trait]
impl StepExecutor for AlwaysFails {
    async fn step(&self, _ctx: &StepContext, _payload: Value) -> StepOutcome {
        StepOutcome::Failed {
            error: "synthetic failure".into(),
        }
    }
}

/// Runs a fixed number of Continue steps before completing, carrying its
/// progress in the payload.
struct MultiStep;

#[async_trait]
impl StepExecutor for MultiStep {
    async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
        let remaining = payload
            .get("stepsRemaining")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let done = payload
            .get("completedSteps")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if remaining == 0 {
            StepOutcome::Done {
                result: json!({"completedSteps": done}),
            }
        } else {
            StepOutcome::Continue {
                payload: json!({
                    "stepsRemaining": remaining - 1,
                    "completedSteps": done + 1,
                }),
                progress: Some(Progress::stage(format!("step-{}", done + 1))),
            }
        }
    }
}

/// Completes immediately; used for chain units.
struct Chapter;

#[async_trait]
impl StepExecutor for Chapter {
    async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
        StepOutcome::Done {
            result: json!({"chapter": payload.get("chapter")}),
        }
    }
}

struct Harness {
    store: Arc<InMemoryJobStore>,
    enqueuer: Enqueuer,
    worker: Worker,
    reconciler: Reconciler,
    chains: ChainController,
}

fn harness() -> Harness {
    let mut registry = Registry::new();
    registry.register("always-fails", Arc::new(AlwaysFails));
    registry.register("multi-step", Arc::new(MultiStep));
    registry.register("chapter", Arc::new(Chapter));

    let store = Arc::new(InMemoryJobStore::new());
    let store_dyn: Arc<dyn JobStore> = store.clone();
    let config = QueueConfig {
        backoff: BackoffPolicy::none(),
        ..QueueConfig::default()
    };

    let enqueuer = Enqueuer::new(store_dyn.clone(), registry.clone());
    let chains = ChainController::new(store_dyn.clone(), enqueuer.clone());
    let worker = Worker::new(store_dyn.clone(), registry, chains.clone(), config);
    let reconciler = Reconciler::new(store_dyn, BTreeSet::from([QUEUE.to_string()]), config);

    Harness {
        store,
        enqueuer,
        worker,
        reconciler,
        chains,
    }
}

fn tenant() -> TenantId {
    TenantId::new_unchecked("acme-academy")
}

// Scenario 1: an always-failing executor with max_retries = 2 dead-letters on
// the third pass with retry_count = 3.
#[tokio::test]
async fn retry_budget_drives_job_to_dead_letter() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(
            EnqueueRequest::new(QUEUE, "always-fails", tenant(), json!({})).with_max_retries(2),
        )
        .await
        .unwrap();

    // First failure: retry_count = 1, still retryable.
    h.worker.run_pass(QUEUE, None).await.unwrap();
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(!job.is_terminal());

    // Second failure: retry_count = 2, still retryable.
    h.worker.run_pass(QUEUE, None).await.unwrap();
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 2);
    assert!(!job.is_terminal());

    // Third failure: budget exceeded.
    let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
    assert_eq!(
        summary.processed.unwrap().disposition,
        StepDisposition::DeadLettered
    );

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);
    assert!(job.error.as_deref().unwrap().contains("synthetic failure"));

    // P3: terminal stability. Another pass and another sweep change nothing.
    h.worker.run_pass(QUEUE, None).await.unwrap();
    h.reconciler
        .reconcile_at(None, Utc::now() + Duration::days(1))
        .await
        .unwrap();
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);
}

// Scenario 2: a worker crash (no write-back, no heartbeat) is repaired by the
// reconciler after the lease TTL.
#[tokio::test]
async fn crashed_worker_is_reclaimed_by_reconciler() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(EnqueueRequest::new(
            QUEUE,
            "multi-step",
            tenant(),
            json!({"stepsRemaining": 3}),
        ))
        .await
        .unwrap();

    // Simulate the crash: claim directly against the store, then never write
    // back or heartbeat again.
    let claimed_at = Utc::now();
    let claimed = h
        .store
        .claim_next(QUEUE, None, claimed_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);

    // Within the lease: P4 says the reconciler must not touch it.
    let summary = h
        .reconciler
        .reconcile_at(None, claimed_at + Duration::seconds(599))
        .await
        .unwrap();
    assert!(summary.requeued.is_empty());

    // After the lease: requeued with retry_count = 1 and a "stale" error.
    let summary = h
        .reconciler
        .reconcile_at(None, claimed_at + Duration::seconds(601))
        .await
        .unwrap();
    assert_eq!(summary.requeued.len(), 1);
    assert_eq!(summary.requeued[0].job_id, id);

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.error.as_deref().unwrap().contains("stale"));
    // Payload preserved: the next claim resumes from the last written state.
    assert_eq!(job.payload, json!({"stepsRemaining": 3}));

    // The job then runs to completion normally.
    for _ in 0..4 {
        h.worker.run_pass(QUEUE, None).await.unwrap();
    }
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

// Scenario 3: pausing a 3-unit chain after unit 1 blocks unit 2 until resume.
#[tokio::test]
async fn chain_pause_blocks_next_unit_until_resume() {
    let h = harness();
    let units = vec![
        ChainUnit::new("chapter-1", "chapter", json!({"chapter": 1})),
        ChainUnit::new("chapter-2", "chapter", json!({"chapter": 2})),
        ChainUnit::new("chapter-3", "chapter", json!({"chapter": 3})),
    ];

    let chain_id = h.chains.create(QUEUE, tenant(), units).await.unwrap();

    // Unit 1 was enqueued at creation; pause before completing it.
    let plan = h.store.get_chain(&chain_id).await.unwrap().unwrap();
    let unit1 = plan.unit_jobs[0].unwrap();
    assert!(plan.unit_jobs[1].is_none());

    let enabled = h.chains.pause(&chain_id).await.unwrap();
    assert!(!enabled);

    // Complete unit 1. The pause does not corrupt the in-flight unit...
    let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
    assert_eq!(summary.processed.unwrap().job_id, unit1);
    let job = h.store.get(QUEUE, &unit1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);

    // ...but unit 2 must not be enqueued while paused (P5).
    let plan = h.store.get_chain(&chain_id).await.unwrap().unwrap();
    assert!(plan.unit_jobs[1].is_none());
    let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
    assert!(summary.processed.is_none());

    // Resume enqueues exactly one next unit.
    let enabled = h.chains.resume(&chain_id).await.unwrap();
    assert!(enabled);

    let plan = h.store.get_chain(&chain_id).await.unwrap().unwrap();
    let unit2 = plan.unit_jobs[1].expect("unit 2 enqueued on resume");
    assert!(plan.unit_jobs[2].is_none());

    let job = h.store.get(QUEUE, &unit2).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // With the gate open, completing unit 2 auto-enqueues unit 3.
    h.worker.run_pass(QUEUE, None).await.unwrap();
    let plan = h.store.get_chain(&chain_id).await.unwrap().unwrap();
    assert!(plan.unit_jobs[2].is_some());
}

// Scenario 4: two simultaneous claims of a single pending job have exactly
// one winner (P1).
#[tokio::test]
async fn simultaneous_claims_have_one_winner() {
    let h = harness();
    h.enqueuer
        .enqueue(EnqueueRequest::new(
            QUEUE,
            "multi-step",
            tenant(),
            json!({"stepsRemaining": 0}),
        ))
        .await
        .unwrap();

    let now = Utc::now();
    let store_a: Arc<dyn JobStore> = h.store.clone();
    let store_b: Arc<dyn JobStore> = h.store.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { store_a.claim_next(QUEUE, None, now).await.unwrap() }),
        tokio::spawn(async move { store_b.claim_next(QUEUE, None, now).await.unwrap() }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(
        a.is_some() ^ b.is_some(),
        "exactly one claim must win: {a:?} vs {b:?}"
    );

    let winner = a.or(b).unwrap();
    assert_eq!(winner.status, JobStatus::Processing);
}

// Scenario 5: five Continue steps across five separate passes, then Done.
// The result reflects only the last step; the trail holds every step in
// order.
#[tokio::test]
async fn five_continues_then_done_with_ordered_trail() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(EnqueueRequest::new(
            QUEUE,
            "multi-step",
            tenant(),
            json!({"stepsRemaining": 5}),
        ))
        .await
        .unwrap();

    for pass in 1..=5u64 {
        let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
        assert_eq!(
            summary.processed.unwrap().disposition,
            StepDisposition::Continued { yielded: true },
            "pass {pass} should continue"
        );
    }

    let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
    assert_eq!(
        summary.processed.unwrap().disposition,
        StepDisposition::Completed
    );

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.result, Some(json!({"completedSteps": 5})));

    // The trail: Enqueued, then 5x (Claimed, StepCompleted), then Claimed,
    // Completed — with seq strictly increasing.
    let events = h.store.events(QUEUE, &id, None).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());

    let steps: Vec<&relay_queue::events::JobEvent> = events
        .iter()
        .filter(|e| matches!(e.kind, JobEventKind::StepCompleted { .. }))
        .collect();
    assert_eq!(steps.len(), 5);
    for (index, event) in steps.iter().enumerate() {
        let stage = event.progress.as_ref().unwrap().stage.clone();
        assert_eq!(stage, format!("step-{}", index + 1));
    }
}

// P6: manual requeue recovers a dead-lettered job and rejects anything else.
#[tokio::test]
async fn manual_requeue_is_explicit_and_consistent() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(
            EnqueueRequest::new(QUEUE, "always-fails", tenant(), json!({})).with_max_retries(0),
        )
        .await
        .unwrap();

    // Requeue of a non-dead-letter job is rejected.
    let result = h
        .store
        .requeue_dead_letter(QUEUE, &id, Utc::now())
        .await
        .unwrap();
    assert!(matches!(result, CasResult::StatusMismatch { .. }));

    h.worker.run_pass(QUEUE, None).await.unwrap();
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);

    // Requeue of the dead-lettered job resets the budget and clears the
    // error.
    let result = h
        .store
        .requeue_dead_letter(QUEUE, &id, Utc::now())
        .await
        .unwrap();
    assert!(result.is_success());

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.error.is_none());
}

// P2: retry_count is non-decreasing across failures, reclaims, and stale
// flags; stale reclaims consume the same budget as failures.
#[tokio::test]
async fn stale_reclaims_share_the_retry_budget() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(
            EnqueueRequest::new(QUEUE, "multi-step", tenant(), json!({"stepsRemaining": 9}))
                .with_max_retries(1),
        )
        .await
        .unwrap();

    // First abandonment consumes retry 1.
    let first_claim = Utc::now();
    h.store.claim_next(QUEUE, None, first_claim).await.unwrap();
    let after_first = first_claim + Duration::seconds(601);
    h.reconciler.reconcile_at(None, after_first).await.unwrap();
    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!((job.status, job.retry_count), (JobStatus::Pending, 1));

    // Second abandonment exceeds the budget: dead letter.
    h.store.claim_next(QUEUE, None, after_first).await.unwrap();
    let after_second = after_first + Duration::seconds(601);
    let summary = h.reconciler.reconcile_at(None, after_second).await.unwrap();
    assert_eq!(summary.dead_lettered.len(), 1);

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!((job.status, job.retry_count), (JobStatus::DeadLetter, 2));
}

// Never-claimed pending jobs are flagged stale but stay claimable and can
// still complete.
#[tokio::test]
async fn stale_flagged_job_still_completes() {
    let h = harness();
    let id = h
        .enqueuer
        .enqueue(EnqueueRequest::new(
            QUEUE,
            "multi-step",
            tenant(),
            json!({"stepsRemaining": 0}),
        ))
        .await
        .unwrap();

    let created = h.store.get(QUEUE, &id).await.unwrap().unwrap().created_at;
    let summary = h
        .reconciler
        .reconcile_at(None, created + Duration::seconds(3601))
        .await
        .unwrap();
    assert_eq!(summary.flagged_stale.len(), 1);

    let job = h.store.get(QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Stale);

    let summary = h.worker.run_pass(QUEUE, None).await.unwrap();
    assert_eq!(
        summary.processed.unwrap().disposition,
        StepDisposition::Completed
    );
}
