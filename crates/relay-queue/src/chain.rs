//! Chaining controller for composite, multi-unit jobs.
//!
//! Composite work (e.g., one job per chapter of a generated book) is broken
//! into ordered units. A control record holds a single gate,
//! `chaining_enabled`; the controller consults it each time a unit finishes
//! and, while the gate is open, enqueues exactly the next unit.
//!
//! Pausing never cancels or corrupts the in-flight unit: it only prevents the
//! *next* unit from being scheduled. Resuming re-derives "what is the next
//! unit" from the control record rather than trusting any cached value, so it
//! is safe even if state was inspected or repaired externally in between.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::{ChainId, JobId, TenantId};

use crate::enqueue::{Enqueuer, EnqueueRequest};
use crate::error::{Error, Result};
use crate::job::JobStatus;
use crate::store::JobStore;

/// One planned unit of a composite chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainUnit {
    /// Human-readable unit label (e.g., `"chapter-3"`).
    pub label: String,
    /// Job type tag for the unit's job.
    pub job_type: String,
    /// Payload for the unit's job.
    pub payload: Value,
}

impl ChainUnit {
    /// Creates a chain unit.
    #[must_use]
    pub fn new(label: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            label: label.into(),
            job_type: job_type.into(),
            payload,
        }
    }
}

/// Control record for a composite chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPlan {
    /// Unique chain identifier.
    pub chain_id: ChainId,
    /// Queue the unit jobs are enqueued into.
    pub queue: String,
    /// Tenant partition key shared by every unit job.
    pub tenant_id: TenantId,
    /// The gate: while false, completed units do not schedule successors.
    pub chaining_enabled: bool,
    /// Ordered units of the composite.
    pub units: Vec<ChainUnit>,
    /// Job enqueued for each unit, parallel to `units`.
    pub unit_jobs: Vec<Option<JobId>>,
    /// When the control record was created.
    pub created_at: DateTime<Utc>,
    /// When the control record was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl ChainPlan {
    /// Creates a control record with the gate open and no units enqueued.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        tenant_id: TenantId,
        units: Vec<ChainUnit>,
        now: DateTime<Utc>,
    ) -> Self {
        let unit_jobs = vec![None; units.len()];
        Self {
            chain_id: ChainId::generate(),
            queue: queue.into(),
            tenant_id,
            chaining_enabled: true,
            units,
            unit_jobs,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the index of the first unit with no enqueued job.
    #[must_use]
    pub fn next_unenqueued(&self) -> Option<usize> {
        self.unit_jobs.iter().position(Option::is_none)
    }

    /// Returns true if every unit has an enqueued job.
    #[must_use]
    pub fn fully_enqueued(&self) -> bool {
        self.next_unenqueued().is_none()
    }
}

/// Thin control surface gating the enqueueing of chain units.
#[derive(Clone)]
pub struct ChainController {
    store: Arc<dyn JobStore>,
    enqueuer: Enqueuer,
}

impl ChainController {
    /// Creates a controller over the given store and enqueuer.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, enqueuer: Enqueuer) -> Self {
        Self { store, enqueuer }
    }

    /// Creates a chain and enqueues its first unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the first unit fails validation; the control
    /// record is still written so the chain can be resumed after a fix.
    pub async fn create(
        &self,
        queue: impl Into<String>,
        tenant: TenantId,
        units: Vec<ChainUnit>,
    ) -> Result<ChainId> {
        let plan = ChainPlan::new(queue, tenant, units, Utc::now());
        let chain_id = plan.chain_id;
        self.store.put_chain(plan).await?;
        self.advance(&chain_id).await?;
        Ok(chain_id)
    }

    /// Closes the gate. The in-flight unit is untouched; once it completes,
    /// no successor is enqueued until [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainNotFound`] if the chain does not exist.
    #[tracing::instrument(skip(self), fields(chain_id = %chain_id))]
    pub async fn pause(&self, chain_id: &ChainId) -> Result<bool> {
        let plan = self.store.set_chaining(chain_id, false).await?;
        tracing::info!("chaining paused");
        Ok(plan.chaining_enabled)
    }

    /// Opens the gate and immediately enqueues the next unit if one remains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainNotFound`] if the chain does not exist.
    #[tracing::instrument(skip(self), fields(chain_id = %chain_id))]
    pub async fn resume(&self, chain_id: &ChainId) -> Result<bool> {
        let plan = self.store.set_chaining(chain_id, true).await?;
        self.advance(chain_id).await?;
        tracing::info!("chaining resumed");
        Ok(plan.chaining_enabled)
    }

    /// Enqueues the next unit if the gate is open and the predecessor unit
    /// completed.
    ///
    /// Called by the worker when a chain-member job reaches `Done`, and by
    /// [`resume`](Self::resume). Always re-derives the next unit from the
    /// control record. Returns the enqueued job id, or `None` when nothing
    /// was scheduled (gate closed, chain fully enqueued, or predecessor not
    /// yet `Done`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainNotFound`] if the chain does not exist.
    pub async fn advance(&self, chain_id: &ChainId) -> Result<Option<JobId>> {
        let plan = self
            .store
            .get_chain(chain_id)
            .await?
            .ok_or(Error::ChainNotFound {
                chain_id: *chain_id,
            })?;

        if !plan.chaining_enabled {
            return Ok(None);
        }

        let Some(next) = plan.next_unenqueued() else {
            return Ok(None);
        };

        // Unit ordering is a correctness requirement: a unit is enqueued
        // only once its predecessor's job is Done.
        if next > 0 {
            let Some(prev_id) = plan.unit_jobs[next - 1] else {
                return Ok(None);
            };
            let prev = self.store.get(&plan.queue, &prev_id).await?;
            if prev.map(|job| job.status) != Some(JobStatus::Done) {
                return Ok(None);
            }
        }

        let unit = &plan.units[next];
        let job_id = self
            .enqueuer
            .enqueue(
                EnqueueRequest::new(
                    plan.queue.clone(),
                    unit.job_type.clone(),
                    plan.tenant_id.clone(),
                    unit.payload.clone(),
                )
                .with_chain(*chain_id, next),
            )
            .await?;
        self.store.bind_unit_job(chain_id, next, job_id).await?;

        tracing::info!(chain_id = %chain_id, unit = next, job_id = %job_id, "chain unit enqueued");
        Ok(Some(job_id))
    }
}

impl std::fmt::Debug for ChainController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainController").finish_non_exhaustive()
    }
}
