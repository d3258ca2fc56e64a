//! HTTP front end for a `CoordinationTree`, served by `djinnd coordinator`.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/coord/v1/sessions` | Open a session |
//! | POST | `/coord/v1/sessions/{id}/keepalive` | Refresh a session |
//! | DELETE | `/coord/v1/sessions/{id}` | Close a session |
//! | POST | `/coord/v1/ops` | Run one operation |
//! | GET | `/coord/v1/health` | Liveness |
//!
//! Every response is HTTP 200 with a `Wire` body; failures travel as
//! typed `CoordError`s.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{debug, info};

use crate::backend::SessionId;
use crate::op::{OpReply, OpRequest, SessionOpened, Wire};
use crate::tree::CoordinationTree;

/// Build the coordination router over a tree.
pub fn coordination_router(tree: CoordinationTree) -> Router {
    Router::new()
        .route("/coord/v1/sessions", post(open_session))
        .route("/coord/v1/sessions/{id}", delete(close_session))
        .route("/coord/v1/sessions/{id}/keepalive", post(keepalive))
        .route("/coord/v1/ops", post(execute))
        .route("/coord/v1/health", get(health))
        .with_state(tree)
}

async fn open_session(State(tree): State<CoordinationTree>) -> Json<Wire<SessionOpened>> {
    let session = tree.create_session();
    Json(Wire::Ok(SessionOpened { session }))
}

async fn keepalive(
    State(tree): State<CoordinationTree>,
    Path(id): Path<SessionId>,
) -> Json<Wire<()>> {
    Json(tree.touch_session(id).into())
}

async fn close_session(
    State(tree): State<CoordinationTree>,
    Path(id): Path<SessionId>,
) -> Json<Wire<()>> {
    tree.end_session(id);
    debug!(session = id, "session closed by client");
    Json(Wire::Ok(()))
}

async fn execute(
    State(tree): State<CoordinationTree>,
    Json(req): Json<OpRequest>,
) -> Json<Wire<OpReply>> {
    Json(tree.apply(req.session, req.op).into())
}

async fn health(State(tree): State<CoordinationTree>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": tree.session_count(),
        "nodes": tree.node_count(),
    }))
}

/// Expire idle sessions until shutdown.
pub async fn run_reaper(
    tree: CoordinationTree,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "session reaper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let expired = tree.reap_expired();
                if expired > 0 {
                    info!(expired, "expired idle sessions");
                }
            }
            _ = shutdown.changed() => {
                info!("session reaper shutting down");
                break;
            }
        }
    }
}
