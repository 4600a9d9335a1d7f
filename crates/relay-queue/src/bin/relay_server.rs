//! Relay queue service: enqueue, status, worker trigger, reconcile trigger,
//! manual requeue, and chain control over HTTP.
//!
//! One process owns the store and exposes every boundary contract; external
//! schedulers drive `/worker/run` and `/reconcile` the way a cron or task
//! scheduler would drive serverless invocations.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::observability::{init_logging, LogFormat};
use relay_core::{ChainId, JobId, TenantId};
use relay_queue::chain::{ChainController, ChainUnit};
use relay_queue::config::{BackoffPolicy, QueueConfig};
use relay_queue::enqueue::{EnqueueRequest, Enqueuer};
use relay_queue::error::{Error, Result};
use relay_queue::executor::{Progress, Registry, StepContext, StepExecutor, StepOutcome};
use relay_queue::reconciler::{ReconcileSummary, Reconciler};
use relay_queue::status::JobStatusView;
use relay_queue::store::memory::InMemoryJobStore;
use relay_queue::store::{CasResult, JobStore};
use relay_queue::worker::{PassSummary, Worker};

#[derive(Clone)]
struct AppState {
    enqueuer: Enqueuer,
    worker: Worker,
    reconciler: Reconciler,
    chains: ChainController,
    status: relay_queue::status::StatusReader,
    store: Arc<dyn JobStore>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::UnknownJobType { .. }
            | Error::InvalidPayload { .. }
            | Error::Serialization { .. } => StatusCode::BAD_REQUEST,
            Error::JobNotFound { .. } | Error::ChainNotFound { .. } => StatusCode::NOT_FOUND,
            Error::NotDeadLettered { .. } => StatusCode::CONFLICT,
            Error::Core(relay_core::Error::InvalidId { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                ok: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Parses a JSON body, treating an empty body as the default value.
///
/// The worker and reconcile triggers are driven by external schedulers that
/// may POST with no body at all.
fn parse_optional_body<T: serde::de::DeserializeOwned + Default>(
    body: &[u8],
) -> std::result::Result<T, ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::from(Error::serialization(format!("invalid request body: {e}"))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueBody {
    job_type: String,
    payload: Value,
    tenant: String,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    ok: bool,
    job_id: JobId,
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> std::result::Result<Json<EnqueueResponse>, ApiError> {
    let tenant = TenantId::new(body.tenant).map_err(Error::from)?;
    let mut request = EnqueueRequest::new(queue, body.job_type, tenant, body.payload);
    if let Some(max_retries) = body.max_retries {
        request = request.with_max_retries(max_retries);
    }

    let job_id = state.enqueuer.enqueue(request).await?;
    Ok(Json(EnqueueResponse { ok: true, job_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    events_limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    ok: bool,
    #[serde(flatten)]
    view: JobStatusView,
}

async fn status_handler(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> std::result::Result<Json<StatusResponse>, ApiError> {
    let job_id: JobId = job_id.parse().map_err(Error::from)?;
    let view = state
        .status
        .job_status(&queue, &job_id, query.events_limit)
        .await?;
    Ok(Json(StatusResponse { ok: true, view }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRunBody {
    job_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRunResponse {
    ok: bool,
    #[serde(flatten)]
    summary: PassSummary,
}

async fn worker_run_handler(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: axum::body::Bytes,
) -> std::result::Result<Json<WorkerRunResponse>, ApiError> {
    let body: WorkerRunBody = parse_optional_body(&body)?;
    let target = match body.job_id {
        Some(raw) => Some(raw.parse::<JobId>().map_err(Error::from)?),
        None => None,
    };

    let summary = state.worker.run_pass(&queue, target).await?;
    Ok(Json(WorkerRunResponse { ok: true, summary }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileBody {
    tenant: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileResponse {
    ok: bool,
    #[serde(flatten)]
    summary: ReconcileSummary,
}

async fn reconcile_handler(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> std::result::Result<Json<ReconcileResponse>, ApiError> {
    let body: ReconcileBody = parse_optional_body(&body)?;
    let tenant = match body.tenant {
        Some(raw) => Some(TenantId::new(raw).map_err(Error::from)?),
        None => None,
    };

    let summary = state.reconciler.reconcile(tenant.as_ref()).await?;
    Ok(Json(ReconcileResponse { ok: true, summary }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequeueResponse {
    ok: bool,
    job_id: JobId,
}

async fn requeue_handler(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, String)>,
) -> std::result::Result<Json<RequeueResponse>, ApiError> {
    let job_id: JobId = job_id.parse().map_err(Error::from)?;
    let result = state
        .store
        .requeue_dead_letter(&queue, &job_id, chrono::Utc::now())
        .await?;

    match result {
        CasResult::Success => Ok(Json(RequeueResponse { ok: true, job_id })),
        CasResult::NotFound => Err(Error::JobNotFound { job_id, queue }.into()),
        CasResult::StatusMismatch { actual } => Err(Error::NotDeadLettered {
            job_id,
            status: actual.to_string(),
        }
        .into()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChainBody {
    queue: String,
    tenant: String,
    units: Vec<ChainUnitBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainUnitBody {
    label: String,
    job_type: String,
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateChainResponse {
    ok: bool,
    chain_id: ChainId,
}

async fn create_chain_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateChainBody>,
) -> std::result::Result<Json<CreateChainResponse>, ApiError> {
    let tenant = TenantId::new(body.tenant).map_err(Error::from)?;
    let units = body
        .units
        .into_iter()
        .map(|unit| ChainUnit::new(unit.label, unit.job_type, unit.payload))
        .collect();

    let chain_id = state.chains.create(body.queue, tenant, units).await?;
    Ok(Json(CreateChainResponse { ok: true, chain_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChainAction {
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
struct ChainControlBody {
    action: ChainAction,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainControlResponse {
    ok: bool,
    chaining_enabled: bool,
}

async fn chain_control_handler(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
    Json(body): Json<ChainControlBody>,
) -> std::result::Result<Json<ChainControlResponse>, ApiError> {
    let chain_id: ChainId = chain_id.parse().map_err(Error::from)?;
    let chaining_enabled = match body.action {
        ChainAction::Pause => state.chains.pause(&chain_id).await?,
        ChainAction::Resume => state.chains.resume(&chain_id).await?,
    };
    Ok(Json(ChainControlResponse {
        ok: true,
        chaining_enabled,
    }))
}

/// Echoes the payload back as the result in a single step.
struct EchoExecutor;

#[async_trait::async_trait]
impl StepExecutor for EchoExecutor {
    async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
        StepOutcome::Done { result: payload }
    }
}

/// Counts `stepsRemaining` down one step per invocation, yielding between
/// steps. Exercises the full yield/resume protocol end to end.
struct CountdownExecutor;

#[async_trait::async_trait]
impl StepExecutor for CountdownExecutor {
    async fn step(&self, _ctx: &StepContext, payload: Value) -> StepOutcome {
        let remaining = payload
            .get("stepsRemaining")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if remaining == 0 {
            StepOutcome::Done {
                result: serde_json::json!({"completedSteps": payload.get("completedSteps")}),
            }
        } else {
            let done = payload
                .get("completedSteps")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            StepOutcome::Continue {
                payload: serde_json::json!({
                    "stepsRemaining": remaining - 1,
                    "completedSteps": done + 1,
                }),
                progress: Some(Progress::stage(format!("step-{}", done + 1))),
            }
        }
    }

    fn validate_payload(&self, payload: &Value) -> std::result::Result<(), String> {
        payload
            .get("stepsRemaining")
            .and_then(Value::as_u64)
            .map(|_| ())
            .ok_or_else(|| "missing numeric field: stepsRemaining".to_string())
    }
}

/// Deployments register their domain executors here; the built-ins exercise
/// the protocol without business payloads.
fn build_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("echo", Arc::new(EchoExecutor));
    registry.register("countdown", Arc::new(CountdownExecutor));
    registry
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn secs_env(key: &str, default: u64) -> Result<Duration> {
    match optional_env(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::configuration(format!("invalid {key}"))),
        None => Ok(Duration::from_secs(default)),
    }
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }
    Ok(8080)
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("RELAY_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn covered_queues_from_env() -> BTreeSet<String> {
    optional_env("RELAY_RECONCILE_QUEUES")
        .unwrap_or_else(|| "agent-jobs,course-jobs".to_string())
        .split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn queue_config_from_env() -> Result<QueueConfig> {
    let lease_ttl = secs_env("RELAY_LEASE_TTL_SECS", 600)?;
    let pending_max_age = secs_env("RELAY_PENDING_MAX_AGE_SECS", 3600)?;
    let backoff_base = secs_env("RELAY_BACKOFF_BASE_SECS", 30)?;
    let backoff_max = secs_env("RELAY_BACKOFF_MAX_SECS", 3600)?;

    Ok(QueueConfig {
        lease_ttl,
        pending_max_age,
        backoff: BackoffPolicy::exponential(backoff_base, backoff_max),
    })
}

fn build_state() -> Result<AppState> {
    let config = queue_config_from_env()?;
    let covered_queues = covered_queues_from_env();

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let registry = build_registry();
    let enqueuer = Enqueuer::new(store.clone(), registry.clone());
    let chains = ChainController::new(store.clone(), enqueuer.clone());
    let worker = Worker::new(store.clone(), registry, chains.clone(), config);
    let reconciler = Reconciler::new(store.clone(), covered_queues, config);
    let status = relay_queue::status::StatusReader::new(store.clone());

    Ok(AppState {
        enqueuer,
        worker,
        reconciler,
        chains,
        status,
        store,
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/queues/{queue}/jobs", post(enqueue_handler))
        .route("/v1/queues/{queue}/jobs/{job_id}", get(status_handler))
        .route(
            "/v1/queues/{queue}/jobs/{job_id}/requeue",
            post(requeue_handler),
        )
        .route("/v1/queues/{queue}/worker/run", post(worker_run_handler))
        .route("/v1/reconcile", post(reconcile_handler))
        .route("/v1/chains", post(create_chain_handler))
        .route("/v1/chains/{chain_id}", post(chain_control_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let state = build_state()?;
    tracing::info!(
        covered_queues = ?state.reconciler.covered_queues(),
        "relay server starting"
    );

    let app = build_router(state);
    let port = resolve_port()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}
