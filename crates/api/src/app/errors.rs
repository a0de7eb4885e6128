use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use postline_infra::watcher::WatchError;

pub fn watch_error_to_response(err: WatchError) -> axum::response::Response {
    match err {
        WatchError::NotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        WatchError::InvalidReport(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_report", msg)
        }
        WatchError::Duplicate(msg) => json_error(StatusCode::BAD_REQUEST, "duplicate", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
