use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mr_protocol::ServerError;

pub mod files;
pub mod proxy;

/// Success envelope shared by every JSON endpoint: `{"result": <value>}`.
pub fn result_response(value: serde_json::Value) -> Response {
    Json(serde_json::json!({ "result": value })).into_response()
}

/// Typed error -> HTTP status plus a plain-text body.
pub fn error_response(err: &ServerError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.message.clone()).into_response()
}
