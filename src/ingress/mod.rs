//! Ingress Gate (C4): `GET /healthz`, `POST /receive`, and the admission
//! predicate gating forwarding on leader state.

pub mod forward;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{election::Election, liveness::Liveness};
use forward::Forwarder;

#[derive(Clone)]
pub struct IngressState {
    pub liveness: Arc<Liveness>,
    pub election: Arc<dyn Election>,
    pub election_enabled: bool,
    pub forwarder: Arc<Forwarder>,
}

/// Pure function of `(election_enabled, is_leader)`: admit iff
/// `!election_enabled || is_leader`.
pub fn admit(election_enabled: bool, is_leader: bool) -> bool {
    !election_enabled || is_leader
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/receive", post(receive))
        .layer(middleware::from_fn(route_errors))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "UP"}))
}

async fn receive(State(state): State<IngressState>, request: Request) -> Response {
    // Stamp happens before the admission check within this single request
    // (spec §5): a follower still records that its producer is alive.
    state.liveness.stamp();

    if !admit(state.election_enabled, state.election.is_leader()) {
        tracing::info!("not leader, suppressing forward");
        return StatusCode::NO_CONTENT.into_response();
    }

    match state.forwarder.forward(request.into_body()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(crate::error::Error::DownstreamFailure { status, body }) => (status, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Rewrites axum's default empty-bodied 404/405 into the spec's
/// `"Invalid path: {path}"` / `"Method not allowed: {method} {path}"` text.
async fn route_errors(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    match response.status() {
        StatusCode::NOT_FOUND => (StatusCode::NOT_FOUND, format!("Invalid path: {path}")).into_response(),
        StatusCode::METHOD_NOT_ALLOWED => (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method not allowed: {method} {path}"),
        )
            .into_response(),
        _ => response,
    }
}
