//! Generic host-proxy handler.
//!
//! Parses the query string with the endpoint's declared parser, forwards
//! the request through the correlator, and wraps the host's answer in the
//! `{"result": ...}` envelope.

use axum::response::Response;
use mr_protocol::{ApiMethod, ArgParserKind, ServerError};
use serde_json::Value;

use crate::registry::Endpoint;
use crate::state::AppState;

use super::{error_response, result_response};

/// Build host args from decoded query pairs.
///
/// Default mode takes one value per key and rejects repeats; status mode
/// collects every value per key, comma-splitting each non-empty value
/// (`?toolhead=position,status&toolhead=speed`). Only a wholly empty
/// value is skipped; empty pieces inside a value are kept.
pub fn parse_args(
    parser: ArgParserKind,
    pairs: &[(String, String)],
) -> Result<Value, ServerError> {
    let mut args = serde_json::Map::new();
    match parser {
        ArgParserKind::Default => {
            for (key, value) in pairs {
                if args
                    .insert(key.clone(), Value::String(value.clone()))
                    .is_some()
                {
                    return Err(ServerError::new("Invalid Query String", 404));
                }
            }
        }
        ArgParserKind::Status => {
            for (key, value) in pairs {
                let entry = args
                    .entry(key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = entry {
                    if !value.is_empty() {
                        list.extend(
                            value.split(',').map(|piece| Value::String(piece.to_owned())),
                        );
                    }
                }
            }
        }
    }
    Ok(Value::Object(args))
}

pub async fn handle(
    state: &AppState,
    endpoint: &Endpoint,
    path: &str,
    method: ApiMethod,
    query_pairs: &[(String, String)],
) -> Response {
    let args = match parse_args(endpoint.arg_parser, query_pairs) {
        Ok(args) => args,
        Err(e) => return error_response(&e),
    };
    match state.make_request(path, method, args).await {
        Ok(result) => result_response(result),
        Err(e) => error_response(&e),
    }
}
