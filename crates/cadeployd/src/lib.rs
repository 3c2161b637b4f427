//! cadeployd — REST surface of the deployer daemon.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/apps` | Cached status of every app |
//! | GET | `/api/v1/apps?ids=a,b` | Cached status of each id, `null` when unknown |
//! | GET | `/api/v1/apps/{id}` | Cached status of one app |
//! | POST | `/api/v1/apps/refresh` | Re-list the cluster now |
//! | GET | `/api/v1/cas/{ca}/apps` | Apps of the CA's owner, by local name |
//! | POST | `/api/v1/cas/{ca}/transactions` | Run a batch of actions for a CA |
//! | GET | `/api/v1/cas/{ca}/replies` | Drain delivered replies for a CA |
//!
//! A CA's command queue lives only while a transaction is in flight.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use cadeploy_manager::DeploymentManager;
use cadeploy_queue::{CheckpointStore, CommandQueue, Mailboxes, Outbox};
use tokio::sync::Mutex;

pub type QueueMap = Arc<Mutex<HashMap<String, Arc<Mutex<CommandQueue>>>>>;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: DeploymentManager,
    pub store: CheckpointStore,
    pub outbox: Outbox,
    pub mailboxes: Mailboxes,
    /// One queue per CA with a transaction in flight.
    pub queues: QueueMap,
}

impl ApiState {
    pub fn new(
        manager: DeploymentManager,
        store: CheckpointStore,
        outbox: Outbox,
        mailboxes: Mailboxes,
    ) -> Self {
        Self {
            manager,
            store,
            outbox,
            mailboxes,
            queues: Arc::default(),
        }
    }
}

/// Forget `ca`'s queue unless another request still holds it.
pub(crate) async fn evict_if_idle(queues: &QueueMap, ca: &str) {
    let mut queues = queues.lock().await;
    if queues.get(ca).is_some_and(|q| Arc::strong_count(q) == 1) {
        queues.remove(ca);
    }
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/apps", get(handlers::list_apps))
        .route("/apps/refresh", post(handlers::refresh_apps))
        .route("/apps/{id}", get(handlers::get_app))
        .route("/cas/{ca}/apps", get(handlers::ca_apps))
        .route("/cas/{ca}/transactions", post(handlers::run_transaction))
        .route("/cas/{ca}/replies", get(handlers::drain_replies))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
