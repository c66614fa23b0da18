//! JSON-RPC 2.0 dispatch for the WebSocket channel.
//!
//! Method names are derived from registered host-proxy endpoints
//! (`post_printer_gcode` = POST `/printer/gcode`); calls are answered by
//! synthesizing the equivalent host request. A single call or a batch array
//! is accepted; notifications (no `id`) produce no reply.

use mr_protocol::ServerError;
use serde_json::Value;
use tracing::info;

use crate::state::AppState;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32603;
/// Catch-all for failures with no better JSON-RPC code. Part of the frozen
/// code table, but never emitted by this dispatcher: every failure it can
/// observe is a typed error whose HTTP status maps directly to `code`.
pub const SERVER_ERROR: i64 = -31000;

/// Process one inbound frame; `None` means nothing is sent back.
pub async fn dispatch(state: &AppState, data: &str) -> Option<String> {
    let request: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "websocket data not json");
            return Some(build_error(PARSE_ERROR, "Parse error", None).to_string());
        }
    };
    let response = match request {
        Value::Array(batch) => {
            let mut replies = Vec::new();
            for call in &batch {
                if let Some(reply) = process_request(state, call).await {
                    replies.push(reply);
                }
            }
            if replies.is_empty() {
                None
            } else {
                Some(Value::Array(replies))
            }
        }
        single => process_request(state, &single).await,
    };
    response.map(|v| v.to_string())
}

async fn process_request(state: &AppState, request: &Value) -> Option<Value> {
    let id = request.get("id").filter(|v| !v.is_null());
    let version = request.get("jsonrpc").and_then(Value::as_str);
    let method = request.get("method").and_then(Value::as_str);
    let (Some("2.0"), Some(method)) = (version, method) else {
        return Some(build_error(INVALID_REQUEST, "Invalid Request", id));
    };

    let Some((path, api_method)) = state.registry.rpc_target(method).await else {
        return Some(build_error(METHOD_NOT_FOUND, "Method not found", id));
    };

    // Object params become named host args; an array is passed through
    // as-is for the host to interpret.
    let args = match request.get("params") {
        None => serde_json::json!({}),
        Some(params @ (Value::Object(_) | Value::Array(_))) => params.clone(),
        Some(_) => {
            return Some(build_error(INVALID_PARAMS, "Invalid params", id));
        }
    };

    match state.make_request(&path, api_method, args).await {
        Ok(result) => id.map(|id| {
            serde_json::json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id,
            })
        }),
        Err(ServerError {
            message,
            status_code,
        }) => Some(build_error(i64::from(status_code), &message, id)),
    }
}

fn build_error(code: i64, message: &str, id: Option<&Value>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id.cloned().unwrap_or(Value::Null),
    })
}
