//! HTTP transport for the control plane.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/rpc/{operation}` | Run one operation; JSON object of named arguments in, reply text out |
//! | GET | `/health` | Liveness |
//!
//! Known operations always answer 200 with the reply string verbatim,
//! sentinels included. Unknown operations answer 404.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::Value;

use crate::plane::{ControlPlane, Operation};
use crate::reply::Reply;

pub fn control_router(plane: ControlPlane) -> Router {
    Router::new()
        .route("/rpc/{operation}", post(rpc))
        .route("/health", get(health))
        .with_state(plane)
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn rpc(
    State(plane): State<ControlPlane>,
    Path(operation): Path<String>,
    body: Bytes,
) -> Response {
    let op: Operation = match operation.parse() {
        Ok(op) => op,
        Err(reason) => return text(StatusCode::NOT_FOUND, Reply::Error(reason).to_string()),
    };
    // An unreadable body has no secret in it.
    let args = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
    let reply = plane.call(op, &args).await;
    text(StatusCode::OK, reply.to_string())
}

async fn health(State(plane): State<ControlPlane>) -> axum::Json<Value> {
    let djinn = plane.djinn();
    axum::Json(serde_json::json!({
        "status": "ok",
        "node": djinn.local_ip(),
        "phase": djinn.phase().as_str(),
        "done_loading": djinn.is_done_loading(),
    }))
}
