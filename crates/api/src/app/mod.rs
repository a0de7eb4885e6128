//! Watcher HTTP surface.
//!
//! `POST /watch/message` and `POST /watch/request-status` feed events to the
//! [`Watcher`]; `GET /health` answers liveness probes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use postline_core::{SendRequestId, WorkerMessageId};
use postline_events::WatchEvent;
use postline_infra::store::Store;
use postline_infra::watcher::Watcher;

pub mod errors;

use errors::{json_error, watch_error_to_response};

pub const MESSAGE_PATH: &str = "/watch/message";
pub const REQUEST_STATUS_PATH: &str = "/watch/request-status";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageReport {
    pub message_id: WorkerMessageId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestStatusReport {
    pub request_id: SendRequestId,
}

pub fn build_app<S: Store>(watcher: Arc<Watcher<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(MESSAGE_PATH, post(report_message::<S>))
        .route(REQUEST_STATUS_PATH, post(report_request_status::<S>))
        .layer(Extension(watcher))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn report_message<S: Store>(
    Extension(watcher): Extension<Arc<Watcher<S>>>,
    body: Result<Json<MessageReport>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(report)) => handle(&watcher, WatchEvent::message(report.message_id)).await,
        Err(rejection) => bad_body(rejection),
    }
}

async fn report_request_status<S: Store>(
    Extension(watcher): Extension<Arc<Watcher<S>>>,
    body: Result<Json<RequestStatusReport>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(report)) => handle(&watcher, WatchEvent::request(report.request_id)).await,
        Err(rejection) => bad_body(rejection),
    }
}

async fn handle<S: Store>(watcher: &Watcher<S>, event: WatchEvent) -> Response {
    match watcher.handle(event).await {
        Ok(reconciliation) => (StatusCode::OK, Json(reconciliation)).into_response(),
        Err(err) => watch_error_to_response(err),
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}
