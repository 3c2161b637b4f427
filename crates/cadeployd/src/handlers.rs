//! REST API handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cadeploy_core::id::owner_of_ca;
use cadeploy_queue::{Action, CommandQueue, QueueResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{ApiState, evict_if_idle};

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Apps ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AppsQuery {
    /// Comma-separated ids.
    #[serde(default)]
    pub ids: Option<String>,
}

/// GET /api/v1/apps[?ids=a,b]
///
/// With `ids`, an array in request order holding `null` for unknown ids.
pub async fn list_apps(
    State(state): State<ApiState>,
    Query(query): Query<AppsQuery>,
) -> impl IntoResponse {
    match query.ids {
        Some(ids) => {
            let ids: Vec<&str> = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .collect();
            ApiResponse::ok(state.manager.stat_apps(&ids)).into_response()
        }
        None => ApiResponse::ok(state.manager.apps_status().as_ref().clone()).into_response(),
    }
}

/// GET /api/v1/apps/{id}
pub async fn get_app(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.stat_app(&id) {
        Some(snapshot) => ApiResponse::ok(snapshot).into_response(),
        None => error_response("app not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// POST /api/v1/apps/refresh
pub async fn refresh_apps(State(state): State<ApiState>) -> impl IntoResponse {
    match state.manager.stat_all().await {
        Ok(status) => ApiResponse::ok(status.as_ref().clone()).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_GATEWAY).into_response(),
    }
}

// ── CA transactions ────────────────────────────────────────────

/// GET /api/v1/cas/{ca}/apps
pub async fn ca_apps(State(state): State<ApiState>, Path(ca): Path<String>) -> impl IntoResponse {
    match owner_of_ca(&ca) {
        Ok(owner) => ApiResponse::ok(state.manager.apps_of_owner(&owner)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    }
}

#[derive(Deserialize)]
pub struct TransactionRequest {
    /// CA method that receives each action's reply.
    #[serde(default)]
    pub reply_method: Option<String>,
    pub actions: Vec<Action>,
}

#[derive(Serialize)]
struct Accepted {
    request_ids: Vec<String>,
}

async fn queue_for(state: &ApiState, ca: &str) -> QueueResult<Arc<Mutex<CommandQueue>>> {
    let mut queues = state.queues.lock().await;
    if let Some(queue) = queues.get(ca) {
        return Ok(queue.clone());
    }
    let queue = Arc::new(Mutex::new(CommandQueue::new(ca, state.outbox.clone())?));
    queues.insert(ca.to_string(), queue.clone());
    Ok(queue)
}

/// Abort the open transaction and let the queue go.
async fn reject(
    state: &ApiState,
    mut queue: OwnedMutexGuard<CommandQueue>,
    msg: &str,
    status: StatusCode,
) -> Response {
    queue.abort();
    let ca = queue.ca().to_string();
    drop(queue);
    evict_if_idle(&state.queues, &ca).await;
    error_response(msg, status).into_response()
}

/// POST /api/v1/cas/{ca}/transactions
///
/// Records and prepares the batch, then commits it in the background.
/// Outcomes arrive as replies.
pub async fn run_transaction(
    State(state): State<ApiState>,
    Path(ca): Path<String>,
    Json(req): Json<TransactionRequest>,
) -> impl IntoResponse {
    let queue = match queue_for(&state, &ca).await {
        Ok(queue) => queue,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };
    let mut queue = queue.lock_owned().await;

    queue.begin();
    let mut request_ids = Vec::with_capacity(req.actions.len());
    for action in req.actions {
        match queue.record(action, req.reply_method.as_deref()) {
            Ok(id) => request_ids.push(id.to_string()),
            Err(e) => return reject(&state, queue, &e.to_string(), StatusCode::BAD_REQUEST).await,
        }
    }

    let checkpoint = match queue.prepare() {
        Ok(checkpoint) => checkpoint,
        Err(e) => return reject(&state, queue, &e.to_string(), StatusCode::CONFLICT).await,
    };
    if let Err(e) = state.store.put(&checkpoint) {
        return reject(&state, queue, &e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).await;
    }

    let manager = state.manager.clone();
    let store = state.store.clone();
    let queues = state.queues.clone();
    tokio::spawn(async move {
        match queue.commit(&manager).await {
            Ok(applied) => debug!(%ca, applied, "transaction committed"),
            Err(e) => warn!(%ca, error = %e, "commit failed"),
        }
        if let Err(e) = store.remove(&ca) {
            warn!(%ca, error = %e, "failed to clear checkpoint");
        }
        drop(queue);
        evict_if_idle(&queues, &ca).await;
    });

    (StatusCode::ACCEPTED, ApiResponse::ok(Accepted { request_ids })).into_response()
}

/// GET /api/v1/cas/{ca}/replies
pub async fn drain_replies(
    State(state): State<ApiState>,
    Path(ca): Path<String>,
) -> impl IntoResponse {
    ApiResponse::ok(state.mailboxes.drain(&ca))
}
