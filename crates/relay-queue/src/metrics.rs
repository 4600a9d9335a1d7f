//! Observability metrics for the queue engine.
//!
//! Prometheus-compatible metrics via the `metrics` crate facade, designed to
//! support:
//!
//! - **Alerting**: SLO-based alerts on step failure rates and dead letters
//! - **Dashboards**: Real-time visibility into queue depth and worker health
//! - **Debugging**: Correlating sweeps and retries with traces
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `relay_queue_transitions_total` | Counter | `from_status`, `to_status` | Job status transitions |
//! | `relay_queue_steps_total` | Counter | `queue`, `outcome` | Step executions by outcome |
//! | `relay_queue_step_duration_seconds` | Histogram | `queue` | Step execution duration |
//! | `relay_queue_depth` | Gauge | `queue` | Non-terminal jobs per queue |
//! | `relay_queue_reconcile_duration_seconds` | Histogram | - | Reconciler sweep duration |
//! | `relay_queue_reclaims_total` | Counter | `queue`, `disposition` | Reconciler corrections |
//! | `relay_queue_dead_letters_total` | Counter | `queue` | Jobs dead-lettered |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to
//! Prometheus, install a recorder such as `metrics_exporter_prometheus` at
//! process startup.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total job status transitions.
    pub const TRANSITIONS_TOTAL: &str = "relay_queue_transitions_total";
    /// Counter: Step executions by outcome.
    pub const STEPS_TOTAL: &str = "relay_queue_steps_total";
    /// Histogram: Step execution duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "relay_queue_step_duration_seconds";
    /// Gauge: Non-terminal jobs per queue.
    pub const QUEUE_DEPTH: &str = "relay_queue_depth";
    /// Histogram: Reconciler sweep duration in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "relay_queue_reconcile_duration_seconds";
    /// Counter: Reconciler corrections by disposition.
    pub const RECLAIMS_TOTAL: &str = "relay_queue_reclaims_total";
    /// Counter: Jobs dead-lettered.
    pub const DEAD_LETTERS_TOTAL: &str = "relay_queue_dead_letters_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous job status (for transitions).
    pub const FROM_STATUS: &str = "from_status";
    /// Target job status (for transitions).
    pub const TO_STATUS: &str = "to_status";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Step outcome (continue, done, failed).
    pub const OUTCOME: &str = "outcome";
    /// Reconciler disposition (requeued, dead_lettered, flagged_stale, skipped).
    pub const DISPOSITION: &str = "disposition";
}

/// High-level interface for recording queue metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    _private: (),
}

impl QueueMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a job status transition.
    pub fn record_transition(&self, from_status: &str, to_status: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM_STATUS => from_status.to_string(),
            labels::TO_STATUS => to_status.to_string(),
        )
        .increment(1);
    }

    /// Records a step execution outcome.
    pub fn record_step(&self, queue: &str, outcome: &str) {
        counter!(
            names::STEPS_TOTAL,
            labels::QUEUE => queue.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records step execution duration.
    pub fn observe_step_duration(&self, queue: &str, duration: Duration) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::QUEUE => queue.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Sets the queue depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::QUEUE => queue.to_string(),
        )
        .set(depth as f64);
    }

    /// Records reconciler sweep duration.
    pub fn observe_reconcile_duration(&self, duration: Duration) {
        histogram!(names::RECONCILE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a reconciler correction.
    pub fn record_reclaim(&self, queue: &str, disposition: &str) {
        counter!(
            names::RECLAIMS_TOTAL,
            labels::QUEUE => queue.to_string(),
            labels::DISPOSITION => disposition.to_string(),
        )
        .increment(1);
    }

    /// Records a dead-lettered job.
    pub fn record_dead_letter(&self, queue: &str) {
        counter!(
            names::DEAD_LETTERS_TOTAL,
            labels::QUEUE => queue.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed
    /// duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
