//! Cluster-management endpoint: join, status, health.

use crate::coordinator::Coordinator;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/join", get(join))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(coordinator)
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    #[serde(rename = "peerID")]
    peer_id: Option<u64>,
    #[serde(rename = "peerAddress")]
    peer_address: Option<String>,
}

async fn join(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<JoinParams>,
) -> impl IntoResponse {
    let (Some(peer_id), Some(peer_address)) = (params.peer_id, params.peer_address) else {
        return (StatusCode::BAD_REQUEST, "missing peerID or peerAddress".to_string());
    };
    if peer_address.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing peerID or peerAddress".to_string());
    }

    match coordinator.handle_join(peer_id, &peer_address).await {
        Ok(()) => (StatusCode::OK, "Joined successfully".to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_leader: bool,
    leader_addr: String,
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let response = StatusResponse {
        is_leader: coordinator.is_leader().await,
        leader_addr: coordinator.leader_addr().await.unwrap_or_default(),
    };
    axum::Json(response)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
