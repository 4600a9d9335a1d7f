//! Append-only per-job event trail.
//!
//! Every state transition and step completion appends an entry with a
//! monotonically increasing, 1-indexed sequence number scoped to the job.
//! The trail exists purely for observability and polling UX; the state
//! machine never reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_core::JobId;

use crate::executor::Progress;
use crate::job::JobStatus;

/// What happened, with the data that distinguishes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    /// The record was created.
    Enqueued,
    /// A worker invocation claimed the job.
    Claimed,
    /// A step finished with more work remaining.
    StepCompleted {
        /// Whether the job was yielded back to the queue.
        yielded: bool,
    },
    /// The job completed successfully.
    Completed,
    /// A step failed; the retry budget still has room.
    Failed {
        /// The recorded error message.
        error: String,
        /// Retry attempts consumed so far.
        retry_count: u32,
    },
    /// The reconciler reclaimed an expired lease.
    Reclaimed {
        /// The synthetic error recorded on the row.
        error: String,
    },
    /// The reconciler flagged a never-claimed pending job.
    FlaggedStale,
    /// The retry budget ran out.
    DeadLettered {
        /// The final error message.
        error: String,
    },
    /// An operator manually requeued the job.
    Requeued,
}

/// One entry in a job's event trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// 1-indexed monotonic sequence number within the job.
    pub seq: u64,
    /// The job this entry belongs to.
    pub job_id: JobId,
    /// What happened.
    #[serde(flatten)]
    pub kind: JobEventKind,
    /// The job's status after the event.
    pub status: JobStatus,
    /// Progress reported by the step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl JobEvent {
    /// Creates a new trail entry.
    #[must_use]
    pub fn new(
        seq: u64,
        job_id: JobId,
        kind: JobEventKind,
        status: JobStatus,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq,
            job_id,
            kind,
            status,
            progress: None,
            recorded_at,
        }
    }

    /// Attaches a progress descriptor.
    #[must_use]
    pub fn with_progress(mut self, progress: Option<Progress>) -> Self {
        self.progress = progress;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_flattened_kind() {
        let event = JobEvent::new(
            1,
            JobId::generate(),
            JobEventKind::Failed {
                error: "timeout".into(),
                retry_count: 2,
            },
            JobStatus::Failed,
            Utc::now(),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json.get("kind").unwrap(), "failed");
        assert_eq!(json.get("error").unwrap(), "timeout");
        assert_eq!(json.get("retry_count").unwrap(), 2);
        assert_eq!(json.get("seq").unwrap(), 1);
    }

    #[test]
    fn event_round_trips() {
        let event = JobEvent::new(
            3,
            JobId::generate(),
            JobEventKind::StepCompleted { yielded: true },
            JobStatus::Pending,
            Utc::now(),
        )
        .with_progress(Some(Progress::stage("chapter-2").with_percent(35)));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.seq, 3);
        assert_eq!(parsed.kind, JobEventKind::StepCompleted { yielded: true });
        assert_eq!(parsed.progress.unwrap().stage, "chapter-2");
    }
}
