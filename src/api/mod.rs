//! HTTP surface implementing the inter-peer mesh protocol.
//!
//! The router is handed queue handles and function-shaped collaborators at
//! construction; it never reaches back into the node by name. Endpoints
//! that read or mutate global job state are leader-gated: a follower
//! answers 503 with the elected leader's endpoint so the caller can
//! redirect itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::dispatch::dispatcher::{self, SharedStore};
use crate::dispatch::{DispatchQueues, FailureTracker, FrameReport, SubmitRequest};
use crate::farmfs::FarmPaths;
use crate::manifest::{ChunkRange, JobManifest};
use crate::peers::{NodeState, PeerRegistry, RenderState};
use crate::render::{RenderQueue, RenderTask};
use crate::store::{JobState, JobSummary, Store};

/// Callback used by the stop/start endpoints. The node wires this to state
/// persistence and render-abort behavior so the API layer stays decoupled.
#[derive(Clone)]
pub struct NodeControl(Arc<dyn Fn(NodeState) + Send + Sync>);

impl NodeControl {
    pub fn new(set_state: impl Fn(NodeState) + Send + Sync + 'static) -> Self {
        Self(Arc::new(set_state))
    }

    pub fn set(&self, state: NodeState) {
        (self.0)(state);
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<PeerRegistry>,
    pub queues: Arc<DispatchQueues>,
    pub store: SharedStore,
    pub leader_ready: Arc<AtomicBool>,
    pub failures: Arc<FailureTracker>,
    pub render: RenderQueue,
    pub paths: FarmPaths,
    pub node_ctl: NodeControl,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status))
        .route("/api/peers", get(peers))
        .route("/api/node/stop", post(node_stop))
        .route("/api/node/start", post(node_start))
        .route("/api/dispatch/assign", post(dispatch_assign))
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/:id", get(job_detail).delete(delete_job))
        .route("/api/jobs/:id/pause", post(pause_job))
        .route("/api/jobs/:id/resume", post(resume_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/archive", post(archive_job))
        .route("/api/jobs/:id/requeue", post(requeue_job))
        .route("/api/jobs/:id/retry-failed", post(retry_failed))
        .route("/api/jobs/:id/resubmit", post(resubmit_job))
        .route("/api/dispatch/complete", post(dispatch_complete))
        .route("/api/dispatch/failed", post(dispatch_failed))
        .route("/api/dispatch/frame-complete", post(frame_complete))
        .route("/api/nodes/:id/unsuspend", post(unsuspend_node))
        .layer(cors)
        .with_state(state)
}

fn ok_body() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn bad_request(message: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.to_string()})),
    )
        .into_response()
}

fn not_leader_response(state: &ApiState) -> Response {
    let mut body = json!({"error": "not_leader"});
    if let Some(endpoint) = state.registry.leader_endpoint() {
        body["leader_endpoint"] = Value::String(endpoint);
    }
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

fn require_leader(state: &ApiState) -> Result<(), Response> {
    if state.registry.is_local_leader() {
        Ok(())
    } else {
        Err(not_leader_response(state))
    }
}

/// Run a store operation on the leader's database. 503 while the database
/// is still restoring or after a storage failure.
async fn with_store<T>(
    state: &ApiState,
    op: impl FnOnce(&Store) -> crate::error::Result<T>,
) -> Result<T, Response> {
    if !state.leader_ready.load(Ordering::SeqCst) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "db_not_ready"})),
        )
            .into_response());
    }
    let guard = state.store.read().await;
    let Some(store) = guard.as_ref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "db_not_ready"})),
        )
            .into_response());
    };
    op(store).map_err(|err| {
        tracing::error!(error = %err, "store operation failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": err.to_string()})),
        )
            .into_response()
    })
}

// --- Any-node endpoints ---

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.local_peer_info())
}

async fn peers(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

async fn node_stop(State(state): State<ApiState>) -> impl IntoResponse {
    state.node_ctl.set(NodeState::Stopped);
    tracing::info!("node stopped remotely");
    ok_body()
}

async fn node_start(State(state): State<ApiState>) -> impl IntoResponse {
    state.node_ctl.set(NodeState::Active);
    tracing::info!("node started remotely");
    ok_body()
}

#[derive(serde::Deserialize)]
struct AssignBody {
    manifest: JobManifest,
    frame_start: i32,
    frame_end: i32,
}

async fn dispatch_assign(State(state): State<ApiState>, body: String) -> Response {
    if state.registry.local_render_state().0 == RenderState::Rendering {
        return (StatusCode::CONFLICT, Json(json!({"error": "busy"}))).into_response();
    }
    if state.registry.local_node_state() == NodeState::Stopped {
        return (StatusCode::CONFLICT, Json(json!({"error": "stopped"}))).into_response();
    }

    let parsed: AssignBody = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => return bad_request(err),
    };

    let task = RenderTask {
        manifest: parsed.manifest,
        chunk: ChunkRange::new(parsed.frame_start, parsed.frame_end),
    };
    match state.render.dispatch(task) {
        Ok(()) => ok_body().into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

// --- Leader-only endpoints ---

#[derive(serde::Deserialize)]
struct SubmitBody {
    manifest: JobManifest,
    #[serde(default = "default_priority")]
    priority: i32,
}

fn default_priority() -> i32 {
    50
}

async fn submit_job(State(state): State<ApiState>, body: String) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    let parsed: SubmitBody = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => return bad_request(err),
    };
    if let Err(err) = parsed.manifest.validate() {
        return bad_request(err);
    }

    let job_id = parsed.manifest.job_id.clone();
    state.queues.push_submission(SubmitRequest {
        manifest: parsed.manifest,
        priority: parsed.priority,
    });
    Json(json!({"status": "ok", "job_id": job_id})).into_response()
}

async fn list_jobs(State(state): State<ApiState>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    match with_store(&state, |store| store.job_summaries()).await {
        Ok(summaries) => {
            let views: Vec<Value> = summaries
                .iter()
                .filter(|s| s.job.current_state != JobState::Archived)
                .map(summary_view)
                .collect();
            Json(views).into_response()
        }
        Err(response) => response,
    }
}

/// Flattened job summary used by the list endpoint and worker-side caches.
fn summary_view(summary: &JobSummary) -> Value {
    let mut view = json!({
        "job_id": summary.job.job_id,
        "current_state": summary.job.current_state,
        "priority": summary.job.priority,
        "submitted_at_ms": summary.job.submitted_at_ms,
        "total_chunks": summary.progress.total,
        "completed_chunks": summary.progress.completed,
        "failed_chunks": summary.progress.failed,
        "rendering_chunks": summary.progress.rendering,
        "pending_chunks": summary.progress.pending,
    });
    if let Ok(manifest) = summary.job.manifest() {
        view["template_id"] = Value::String(manifest.template_id);
        view["submitted_by"] = Value::String(manifest.submitted_by);
        view["frame_start"] = manifest.frame_start.into();
        view["frame_end"] = manifest.frame_end.into();
        view["chunk_size"] = manifest.chunk_size.into();
        if let Some(output_dir) = manifest.output_dir {
            view["output_dir"] = Value::String(output_dir);
        }
    }
    view
}

async fn job_detail(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    let detail = with_store(&state, |store| {
        let Some(job) = store.job(&job_id)? else {
            return Ok(None);
        };
        let chunks = store.chunks_for_job(&job_id)?;
        Ok(Some((job, chunks)))
    })
    .await;

    match detail {
        Ok(Some((job, chunks))) => {
            let manifest: Value =
                serde_json::from_str(&job.manifest_json).unwrap_or(Value::Null);
            Json(json!({
                "job_id": job.job_id,
                "current_state": job.current_state,
                "priority": job.priority,
                "submitted_at_ms": job.submitted_at_ms,
                "manifest": manifest,
                "chunks": chunks,
            }))
            .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found"})),
        )
            .into_response(),
        Err(response) => response,
    }
}

async fn set_job_state(state: &ApiState, job_id: &str, new_state: JobState) -> Response {
    if let Err(response) = require_leader(state) {
        return response;
    }
    match with_store(state, |store| store.update_job_state(job_id, new_state)).await {
        Ok(found) => {
            if found {
                tracing::info!(job_id = %job_id, state = %new_state, "job state changed");
            }
            ok_body().into_response()
        }
        Err(response) => response,
    }
}

async fn pause_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    set_job_state(&state, &job_id, JobState::Paused).await
}

async fn resume_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    set_job_state(&state, &job_id, JobState::Active).await
}

async fn cancel_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    // Cancellation also aborts any local render of the job on this node.
    state.render.cancel_job(&job_id);
    set_job_state(&state, &job_id, JobState::Cancelled).await
}

async fn archive_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    set_job_state(&state, &job_id, JobState::Archived).await
}

async fn delete_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    state.render.cancel_job(&job_id);
    match with_store(&state, |store| store.delete_job(&job_id)).await {
        Ok(_) => {
            let job_dir = state.paths.job_dir(&job_id);
            if let Err(err) = std::fs::remove_dir_all(&job_dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to remove job directory");
                }
            }
            tracing::info!(job_id = %job_id, "job deleted");
            ok_body().into_response()
        }
        Err(response) => response,
    }
}

/// Requeue the whole job from scratch: every chunk back to pending with
/// retries, blacklists and frame progress cleared.
async fn requeue_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    match with_store(&state, |store| {
        store.reset_all_chunks(&job_id)?;
        store.update_job_state(&job_id, JobState::Active)
    })
    .await
    {
        Ok(found) => {
            if found {
                tracing::info!(job_id = %job_id, "job requeued");
            }
            ok_body().into_response()
        }
        Err(response) => response,
    }
}

async fn retry_failed(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    match with_store(&state, |store| store.retry_failed_chunks(&job_id)).await {
        Ok(count) => Json(json!({"status": "ok", "retried": count})).into_response(),
        Err(response) => response,
    }
}

async fn resubmit_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    let result = with_store(&state, |store| {
        dispatcher::resubmit_job(store, &job_id).map(Some).or_else(|err| match err {
            crate::error::FarmError::JobNotFound(_) => Ok(None),
            other => Err(other),
        })
    })
    .await;

    match result {
        Ok(Some(new_id)) => Json(json!({"status": "ok", "job_id": new_id})).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found"})),
        )
            .into_response(),
        Err(response) => response,
    }
}

async fn dispatch_complete(State(state): State<ApiState>, body: String) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    match serde_json::from_str(&body) {
        Ok(report) => {
            state.queues.push_completion(report);
            ok_body().into_response()
        }
        Err(err) => bad_request(err),
    }
}

async fn dispatch_failed(State(state): State<ApiState>, body: String) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    match serde_json::from_str(&body) {
        Ok(report) => {
            state.queues.push_failure(report);
            ok_body().into_response()
        }
        Err(err) => bad_request(err),
    }
}

#[derive(serde::Deserialize)]
struct FrameCompleteBody {
    #[serde(default)]
    node_id: String,
    job_id: String,
    frames: Vec<i32>,
}

async fn frame_complete(State(state): State<ApiState>, body: String) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    let parsed: FrameCompleteBody = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(err) => return bad_request(err),
    };
    for frame in parsed.frames {
        state.queues.push_frame(FrameReport {
            node_id: parsed.node_id.clone(),
            job_id: parsed.job_id.clone(),
            frame,
        });
    }
    ok_body().into_response()
}

async fn unsuspend_node(State(state): State<ApiState>, Path(node_id): Path<String>) -> Response {
    if let Err(response) = require_leader(&state) {
        return response;
    }
    state.failures.clear(&node_id);
    tracing::info!(node_id = %node_id, "node unsuspended");
    ok_body().into_response()
}
