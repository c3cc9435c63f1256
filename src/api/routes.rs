/*
* Fleet provisioner HTTP API
* --------------------------
*
* Thin axum layer over the queue store and the provisioning pipeline. All the
* actual work happens in `provision::pipeline`; handlers only validate,
* enqueue, kick off runs and read back state.
*
* Endpoints (under `server.api_prefix`, default /api/v1):
*   GET    /queue          - every queue item
*   POST   /queue          - enqueue a create or delete item
*   GET    /queue/{id}     - one item
*   POST   /queue/run      - start a run (409 while one is running)
*                            `?wait=true` blocks and returns the summary
*   POST   /queue/cancel   - ask the running pipeline to stop
*   GET    /runs/last      - summary of the last finished run
*   GET    /tasks          - per-item task logs of the current/last run
*   GET    /tasks/{id}     - task log of one item
*
* Only one run at a time: the run lock is taken with `try_lock_owned`, so a
* second trigger is refused instead of queued behind the first. Runs always
* live on their own task; `?wait=true` only awaits its handle.
*/

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::error::ApiError;
use crate::config::Settings;
use crate::core::gateway::HypervisorGateway;
use crate::core::queue::{
    InMemoryQueueStore, QueueAction, QueueItem, QueueStore, ResourceMode, StorageMode,
};
use crate::monitoring::{EventBus, RunState, TaskRecord, TaskTracker, TracingSink};
use crate::provision::{
    CancellationFlag, CloudInitPayloadBuilder, IdentityPatcher, IsoProvisioner,
    ProvisioningPipeline, RunContext, RunSummary, SequentialIdentityPatcher,
};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_IN_FLIGHT: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InMemoryQueueStore>,
    pub gateway: Arc<dyn HypervisorGateway>,
    pub settings: Arc<Settings>,
    pub tracker: Arc<TaskTracker>,
    pub cancel: CancellationFlag,
    pub identity: Arc<dyn IdentityPatcher>,
    pub iso: Arc<dyn IsoProvisioner>,
    pub run_lock: Arc<Mutex<()>>,
    pub last_run: Arc<RwLock<Option<RunSummary>>>,
}

impl AppState {
    pub fn new(
        store: Arc<InMemoryQueueStore>,
        gateway: Arc<dyn HypervisorGateway>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            tracker: Arc::new(TaskTracker::default()),
            cancel: CancellationFlag::new(),
            identity: Arc::new(SequentialIdentityPatcher::default()),
            iso: Arc::new(CloudInitPayloadBuilder::default()),
            run_lock: Arc::new(Mutex::new(())),
            last_run: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityPatcher>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_iso(mut self, iso: Arc<dyn IsoProvisioner>) -> Self {
        self.iso = iso;
        self
    }

    pub fn run_context(&self) -> RunContext {
        RunContext {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            events: EventBus::new()
                .with_sink(Arc::new(TracingSink))
                .with_sink(self.tracker.clone()),
            identity: self.identity.clone(),
            iso: self.iso.clone(),
        }
    }

    /// Runs the pipeline while holding the run lock, then records the
    /// summary.
    async fn run_locked(&self, _guard: OwnedMutexGuard<()>) -> RunSummary {
        let summary = ProvisioningPipeline::new(self.run_context()).run().await;
        *self.last_run.write().await = Some(summary.clone());
        summary
    }
}

/// Body of `POST /queue`. The store assigns the id.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default)]
    pub action: QueueAction,
    #[serde(default)]
    pub name: String,
    pub target_vm_id: Option<i64>,
    pub storage: Option<String>,
    pub storage_mode: Option<StorageMode>,
    pub format: Option<String>,
    pub resource_mode: Option<ResourceMode>,
    pub cores: Option<u32>,
    pub memory: Option<u64>,
    pub disk_gib: Option<u64>,
    pub project_id: Option<String>,
}

impl From<EnqueueRequest> for QueueItem {
    fn from(request: EnqueueRequest) -> Self {
        QueueItem {
            id: String::new(),
            action: request.action,
            name: request.name,
            target_vm_id: request.target_vm_id,
            storage: request.storage,
            storage_mode: request.storage_mode,
            format: request.format,
            resource_mode: request.resource_mode,
            cores: request.cores,
            memory: request.memory,
            disk_gib: request.disk_gib,
            project_id: request.project_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct RunStarted {
    pub started: bool,
    pub state: RunState,
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/queue", get(list_queue).post(enqueue))
        .route("/queue/run", post(start_run))
        .route("/queue/cancel", post(cancel_run))
        .route("/queue/{id}", get(get_item))
        .route("/runs/last", get(last_run))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task));

    let prefix = state.settings.server.api_prefix.trim_end_matches('/').to_string();
    let router = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&prefix, api)
    };

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT))
}

async fn list_queue(State(state): State<AppState>) -> Json<Vec<QueueItem>> {
    Json(state.store.snapshot().await)
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.store.enqueue(request.into()).await?;
    info!(item_id = %item.id, action = ?item.action, name = %item.name, "item enqueued");
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueItem>, ApiError> {
    let item = state.store.get(&id).await;
    item.map(Json)
        .ok_or(ApiError::NotFound { what: "queue item", id })
}

async fn start_run(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<axum::response::Response, ApiError> {
    let guard = state
        .run_lock
        .clone()
        .try_lock_owned()
        .map_err(|_| ApiError::RunInProgress)?;

    state.cancel.reset();
    state.tracker.clear();

    // the run owns its task; a client hanging up never cuts it short
    let background = state.clone();
    let run = tokio::spawn(async move { background.run_locked(guard).await });

    if params.wait {
        let summary = run.await.map_err(|e| ApiError::RunAborted(e.to_string()))?;
        return Ok(Json(summary).into_response());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(RunStarted {
            started: true,
            state: RunState::Running,
        }),
    )
        .into_response())
}

async fn cancel_run(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.run_lock.try_lock().is_err();
    if running {
        state.cancel.cancel();
        warn!("cancellation requested");
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "cancelling": running })),
    )
}

async fn last_run(State(state): State<AppState>) -> Result<Json<RunSummary>, ApiError> {
    state
        .last_run
        .read()
        .await
        .clone()
        .map(Json)
        .ok_or(ApiError::NotFound {
            what: "run",
            id: "last".into(),
        })
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskRecord>> {
    Json(state.tracker.tasks())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    let record = state.tracker.task(&id);
    record
        .map(Json)
        .ok_or(ApiError::NotFound { what: "task", id })
}

/// Binds and serves until ctrl-c.
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let addr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}
