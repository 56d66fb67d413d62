//! Reference ingress adapter (§6 of the design this binary implements):
//! `POST /insert-val` with a msgpack-encoded `Command` body, and
//! `GET /get-val?key=...`. Scoped as an external collaborator in the
//! design this binary follows, but shipped here so the binary is directly
//! runnable; it only calls the two contracts the Coordinator exposes.

use crate::coordinator::Coordinator;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/insert-val", post(insert_val))
        .route("/get-val", get(get_val))
        .with_state(coordinator)
}

async fn insert_val(
    State(coordinator): State<Arc<Coordinator>>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // The Open-Question compatibility choice: always answer HTTP 200, with
    // body "error" on proposal failure rather than a non-200 status. This
    // preserves the original adapter's behavior; it is not endorsed as a
    // design improvement.
    if coordinator.propose(body.to_vec()).await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::OK, "error")
    }
}

#[derive(Debug, Deserialize)]
struct GetValParams {
    key: String,
}

async fn get_val(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<GetValParams>,
) -> impl IntoResponse {
    match coordinator.get(&params.key) {
        Some(value) => (StatusCode::OK, value),
        None => (StatusCode::NOT_FOUND, "Key Not Found".to_string()),
    }
}
