//! Static file serving, deletion and multipart upload.
//!
//! Files live under a root announced by the host (the virtual SD card
//! directory, or a single file for the log endpoint). Deletes and uploads
//! are gated by a host round-trip so a file cannot be touched while a print
//! is reading it.

use axum::body::Body;
use axum::extract::Multipart;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use mr_protocol::{ApiMethod, ServerError};
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::registry::Endpoint;
use crate::state::AppState;

use super::{error_response, result_response};

/// Resolve a request against the endpoint's file root.
///
/// With a capture the root is a directory and the capture a relative path
/// inside it; without one the root itself is the file. Anything stepping
/// outside the root is refused.
fn resolve_target(root: &Path, capture: Option<&str>) -> Option<PathBuf> {
    match capture {
        None => Some(root.to_path_buf()),
        Some(rel) => {
            if rel.is_empty() {
                return None;
            }
            let rel = Path::new(rel);
            if rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return None;
            }
            Some(root.join(rel))
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("log" | "gcode" | "g") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub async fn download(endpoint: &Endpoint, capture: Option<String>) -> Response {
    let Some(root) = endpoint.static_path.as_deref() else {
        return error_response(&ServerError::new("endpoint has no file root", 500));
    };
    let Some(target) = resolve_target(root, capture.as_deref()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(metadata) = tokio::fs::metadata(&target).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !metadata.is_file() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let file = match tokio::fs::File::open(&target).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&target))
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", basename(&target)),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub async fn delete(state: &AppState, endpoint: &Endpoint, capture: Option<String>) -> Response {
    let Some(root) = endpoint.static_path.as_deref() else {
        return error_response(&ServerError::new("endpoint has no file root", 500));
    };
    let Some(target) = resolve_target(root, capture.as_deref()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if tokio::fs::metadata(&target).await.is_err() {
        return StatusCode::NOT_FOUND.into_response();
    }

    // The host refuses with 403 while the file is loaded; any other host
    // error (including "not connected") does not block the delete.
    let gate = state
        .make_request(
            &endpoint.pattern,
            ApiMethod::Delete,
            serde_json::json!({"filename": target.to_string_lossy()}),
        )
        .await;
    if let Err(e) = &gate {
        if e.status_code == 403 {
            return error_response(&ServerError::new(
                "File is loaded, DELETE not permitted",
                403,
            ));
        }
    }

    if let Err(e) = tokio::fs::remove_file(&target).await {
        warn!(path = %target.display(), error = %e, "failed to delete file");
        return error_response(&ServerError::new("Unable to delete file", 500));
    }
    let filename = basename(&target);
    state.notify_filelist_changed(filename.clone(), "removed");
    result_response(serde_json::json!(filename))
}

pub async fn upload(
    state: &AppState,
    endpoint: &Endpoint,
    request_path: &str,
    mut multipart: Multipart,
) -> Response {
    let Some(root) = endpoint.static_path.as_deref() else {
        return error_response(&ServerError::new("endpoint has no file root", 500));
    };

    let mut upload: Option<(String, bytes::Bytes)> = None;
    let mut print_requested = false;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(_) => {
                return error_response(&ServerError::new("Bad Request, invalid multipart", 400));
            }
        };
        if let Some(filename) = field.file_name().map(ToOwned::to_owned) {
            if upload.is_some() {
                return error_response(&ServerError::new(
                    "Bad Request, can only process a single file upload",
                    400,
                ));
            }
            match field.bytes().await {
                Ok(data) => upload = Some((filename, data)),
                Err(_) => {
                    return error_response(&ServerError::new("Unable to read upload body", 400));
                }
            }
        } else if field.name() == Some("print") {
            let value = field.text().await.unwrap_or_default();
            print_requested = value.to_lowercase() == "true";
        }
    }
    let Some((filename, data)) = upload else {
        return error_response(&ServerError::new(
            "Bad Request, can only process a single file upload",
            400,
        ));
    };

    // Runs of whitespace in the client-supplied name collapse to '_'.
    let filename = filename.split_whitespace().collect::<Vec<_>>().join("_");
    if filename.is_empty() || filename.contains('/') || filename == ".." {
        return error_response(&ServerError::new("Bad Request, invalid filename", 400));
    }
    let full_path = root.join(&filename);

    // Safety check with the host: 403 means the file is being printed.
    // On success the host reports whether a print is ongoing; a print is
    // only auto-started on an explicit `print_ongoing: false`. Any host
    // error leaves the upload allowed but never starts a print.
    let mut start_print = print_requested;
    match state
        .make_request(
            request_path,
            ApiMethod::Post,
            serde_json::json!({"filename": full_path.to_string_lossy()}),
        )
        .await
    {
        Ok(result) => {
            start_print = start_print
                && matches!(
                    result.get("print_ongoing"),
                    Some(serde_json::Value::Bool(false))
                );
        }
        Err(e) if e.status_code == 403 => {
            return error_response(&ServerError::new(
                "File is loaded, upload not permitted",
                403,
            ));
        }
        Err(_) => start_print = false,
    }

    if let Err(e) = tokio::fs::write(&full_path, &data).await {
        warn!(path = %full_path.display(), error = %e, "failed to save upload");
        return error_response(&ServerError::new("Unable to save file", 500));
    }
    state.notify_filelist_changed(filename.clone(), "added");

    if start_print {
        let started = state
            .make_request(
                "/printer/print/start",
                ApiMethod::Post,
                serde_json::json!({"filename": filename}),
            )
            .await;
        if let Err(e) = started {
            return error_response(&e);
        }
    }

    axum::Json(serde_json::json!({
        "result": filename,
        "print_started": start_print,
    }))
    .into_response()
}
