//! Job admission: validation and insertion.
//!
//! The enqueuer is the only component that creates job records. A request is
//! rejected before any row is written when its type tag is unregistered or
//! its payload fails the executor's validation hook; there is no partial
//! insert.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use relay_core::{ChainId, JobId, TenantId};

use crate::error::{Error, Result};
use crate::executor::Registry;
use crate::job::JobRecord;
use crate::store::JobStore;

/// A validated enqueue request.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Target queue (logical job table).
    pub queue: String,
    /// Job type tag; must have a registered executor.
    pub job_type: String,
    /// Tenant partition key.
    pub tenant: TenantId,
    /// Opaque payload handed to the step executor.
    pub payload: Value,
    /// Retry budget override; defaults to the record default when `None`.
    pub max_retries: Option<u32>,
    /// Chain membership when this job is a composite unit.
    pub chain: Option<(ChainId, usize)>,
}

impl EnqueueRequest {
    /// Creates a request with default retry budget and no chain membership.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        tenant: TenantId,
        payload: Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            tenant,
            payload,
            max_retries: None,
            chain: None,
        }
    }

    /// Overrides the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Marks the job as a unit of a chain.
    #[must_use]
    pub const fn with_chain(mut self, chain_id: ChainId, unit: usize) -> Self {
        self.chain = Some((chain_id, unit));
        self
    }
}

/// Validates requests and inserts pending job records.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    registry: Registry,
}

impl Enqueuer {
    /// Creates an enqueuer over the given store and executor registry.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, registry: Registry) -> Self {
        Self { store, registry }
    }

    /// Enqueues a job and returns its id.
    ///
    /// The returned id is immediately visible to status reads.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownJobType`] if no executor is registered for the tag
    /// - [`Error::InvalidPayload`] if the executor rejects the payload
    /// - [`Error::Storage`] if the insert fails (no row was created)
    #[tracing::instrument(skip(self, request), fields(queue = %request.queue, job_type = %request.job_type, tenant = %request.tenant))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        let executor = self.registry.get(&request.job_type)?;
        executor
            .validate_payload(&request.payload)
            .map_err(|message| Error::InvalidPayload {
                job_type: request.job_type.clone(),
                message,
            })?;

        let now = Utc::now();
        let mut job = JobRecord::new(
            request.queue,
            request.job_type,
            request.tenant,
            request.payload,
            now,
        );
        if let Some(max_retries) = request.max_retries {
            job = job.with_max_retries(max_retries);
        }
        if let Some((chain_id, unit)) = request.chain {
            job = job.with_chain(chain_id, unit);
        }

        let id = job.id;
        self.store.insert(job).await?;
        tracing::info!(job_id = %id, "job enqueued");
        Ok(id)
    }
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{StepContext, StepExecutor, StepOutcome};
    use crate::job::JobStatus;
    use crate::store::memory::InMemoryJobStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Outline;

    #[async_trait]
    impl StepExecutor for Outline {
        async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
            StepOutcome::Done { result: payload }
        }

        fn validate_payload(&self, payload: &Value) -> std::result::Result<(), String> {
            payload
                .get("topic")
                .map(|_| ())
                .ok_or_else(|| "missing field: topic".to_string())
        }
    }

    fn enqueuer() -> (Arc<InMemoryJobStore>, Enqueuer) {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = Registry::new();
        registry.register("outline", Arc::new(Outline));
        let enqueuer = Enqueuer::new(store.clone(), registry);
        (store, enqueuer)
    }

    fn tenant() -> TenantId {
        TenantId::new_unchecked("acme-academy")
    }

    #[tokio::test]
    async fn enqueue_creates_pending_record() {
        let (store, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(EnqueueRequest::new(
                "course-jobs",
                "outline",
                tenant(),
                json!({"topic": "algebra"}),
            ))
            .await
            .unwrap();

        // Immediately visible to reads.
        let job = store.get("course-jobs", &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.job_type, "outline");
    }

    #[tokio::test]
    async fn unknown_job_type_writes_no_row() {
        let (store, enqueuer) = enqueuer();

        let err = enqueuer
            .enqueue(EnqueueRequest::new(
                "course-jobs",
                "mystery",
                tenant(),
                json!({}),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownJobType { .. }));
        assert!(store.queue_depths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_writes_no_row() {
        let (store, enqueuer) = enqueuer();

        let err = enqueuer
            .enqueue(EnqueueRequest::new(
                "course-jobs",
                "outline",
                tenant(),
                json!({"no_topic": true}),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidPayload { .. }));
        assert!(store.queue_depths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_override_is_applied() {
        let (store, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(
                EnqueueRequest::new("course-jobs", "outline", tenant(), json!({"topic": "x"}))
                    .with_max_retries(7),
            )
            .await
            .unwrap();

        let job = store.get("course-jobs", &id).await.unwrap().unwrap();
        assert_eq!(job.max_retries, 7);
    }
}
