// mr-protocol: Gateway <-> host wire protocol types and serialization.
//
// All socket messages are JSON objects separated by a single NUL byte.
// Host-originated messages use a top-level `method` field for discriminated
// deserialization, with the payload under `params`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod codec;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// HTTP methods admitted by the endpoint registry.
///
/// Serialized uppercase (`"GET"`), matching both the hook manifests and the
/// `method` field of gateway requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiMethod {
    Get,
    Post,
    Delete,
}

impl ApiMethod {
    /// Uppercase wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            ApiMethod::Get => "GET",
            ApiMethod::Post => "POST",
            ApiMethod::Delete => "DELETE",
        }
    }

    /// Lowercase form used to derive JSON-RPC method names.
    pub fn lower(self) -> &'static str {
        match self {
            ApiMethod::Get => "get",
            ApiMethod::Post => "post",
            ApiMethod::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApiMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(ApiMethod::Get),
            "POST" => Ok(ApiMethod::Post),
            "DELETE" => Ok(ApiMethod::Delete),
            _ => Err(()),
        }
    }
}

/// The typed error carried across every layer of the gateway.
///
/// On the wire it appears as a response value of the shape
/// `{"error": ..., "message": ..., "status_code": ...}`; in HTTP responses
/// the status code becomes the HTTP status, and in JSON-RPC replies it
/// becomes the error `code`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
    pub status_code: u16,
}

impl ServerError {
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        ServerError {
            message: message.into(),
            status_code,
        }
    }

    /// Wire form used when the host reports a request failure.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "ServerError",
            "message": self.message,
            "status_code": self.status_code,
        })
    }

    /// Recover a typed error from a host response value.
    ///
    /// Any JSON object containing an `error` key is treated as an error
    /// payload; a missing `status_code` defaults to 400.
    pub fn from_response(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if !obj.contains_key("error") {
            return None;
        }
        let message = obj
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown host error")
            .to_owned();
        let status_code = obj
            .get("status_code")
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(400);
        Some(ServerError {
            message,
            status_code,
        })
    }
}

// ---------------------------------------------------------------------------
// Gateway -> host
// ---------------------------------------------------------------------------

/// A proxied client request, correlated by `id`.
///
/// The host answers with a `response` message carrying the same id as
/// `request_id`. Ids are unique for the gateway's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub id: u64,
    pub path: String,
    pub method: ApiMethod,
    pub args: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Host -> gateway
// ---------------------------------------------------------------------------

/// Reply to a [`GatewayRequest`].
///
/// `response` is an arbitrary JSON value; an object containing an `error`
/// key is the wire form of [`ServerError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseParams {
    pub request_id: u64,
    pub response: serde_json::Value,
}

/// A host event with no correlation id, fanned out to every WebSocket
/// as `notify_<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationParams {
    pub name: String,
    pub state: serde_json::Value,
}

/// One endpoint announcement: `[path, methods, extras]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook(pub String, pub Vec<ApiMethod>, pub HookExtras);

impl Hook {
    pub fn path(&self) -> &str {
        &self.0
    }

    pub fn methods(&self) -> &[ApiMethod] {
        &self.1
    }

    pub fn extras(&self) -> &HookExtras {
        &self.2
    }
}

/// Which gateway handler serves an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Forward to the host and return `{"result": ...}`.
    #[default]
    HostProxy,
    /// Serve (and optionally DELETE) files from `HookExtras::path`.
    StaticFile,
    /// Multipart upload into `HookExtras::path`.
    FileUpload,
    /// Mint a one-shot access token.
    AccessToken,
}

/// Query-string parsing mode for host-proxy endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgParserKind {
    /// One value per key; a repeated key is rejected.
    #[default]
    Default,
    /// Every value comma-split into a list; empty pieces skipped.
    Status,
}

/// Per-endpoint handler parameters carried in a hook manifest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookExtras {
    #[serde(default)]
    pub handler: HandlerKind,
    #[serde(default)]
    pub arg_parser: ArgParserKind,
    /// Filesystem root for `static_file` / `file_upload` handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddHookParams {
    pub hook: Hook,
}

/// Runtime configuration pushed by the host after it connects.
///
/// Unknown keys are ignored; every known key has a default so the gateway
/// is fully operational before the first `load_config` arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base host round-trip timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,
    /// Per-path timeout overrides in seconds.
    #[serde(default)]
    pub long_running_requests: HashMap<String, f64>,
    /// Per-G-code timeout overrides, keyed by the uppercased first token
    /// of the submitted script.
    #[serde(default)]
    pub long_running_gcodes: HashMap<String, f64>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub require_auth: bool,
    #[serde(default)]
    pub enable_cors: bool,
    /// Literal dotted-quad IPv4 addresses.
    #[serde(default)]
    pub trusted_ips: Vec<String>,
    /// /24 prefixes stored as the first three octets (`"192.168.1"`).
    #[serde(default)]
    pub trusted_ranges: Vec<String>,
}

fn default_request_timeout() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            request_timeout: default_request_timeout(),
            long_running_requests: HashMap::new(),
            long_running_gcodes: HashMap::new(),
            api_key: String::new(),
            require_auth: true,
            enable_cors: false,
            trusted_ips: Vec::new(),
            trusted_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfigParams {
    pub config: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlippyReadyParams {
    /// Temperature sensor names the gateway should track.
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlippyShutdownParams {}

// ---------------------------------------------------------------------------
// Top-level discriminated union (host -> gateway)
// ---------------------------------------------------------------------------

/// All message kinds the host may send to the gateway.
///
/// Serializes/deserializes using the `method` field as a tag with the
/// payload under `params`:
///
/// ```json
/// { "method": "response", "params": { "request_id": 7, "response": "ok" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
#[serde(rename_all = "snake_case")]
pub enum HostMessage {
    Response(ResponseParams),
    Notification(NotificationParams),
    AddHook(AddHookParams),
    LoadConfig(LoadConfigParams),
    SetKlippyReady(KlippyReadyParams),
    SetKlippyShutdown(KlippyShutdownParams),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_request_serializes_with_uppercase_method() {
        let req = GatewayRequest {
            id: 42,
            path: "/printer/objects".to_owned(),
            method: ApiMethod::Get,
            args: serde_json::json!({}),
        };
        let value = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(
            value,
            serde_json::json!({
                "id": 42,
                "path": "/printer/objects",
                "method": "GET",
                "args": {},
            })
        );
    }

    #[test]
    fn response_message_parses_from_wire_shape() {
        let raw = r#"{"method":"response","params":{"request_id":7,"response":"ok"}}"#;
        let msg: HostMessage = serde_json::from_str(raw).expect("parse response");
        assert_eq!(
            msg,
            HostMessage::Response(ResponseParams {
                request_id: 7,
                response: serde_json::json!("ok"),
            })
        );
    }

    #[test]
    fn add_hook_round_trips_as_three_element_array() {
        let msg = HostMessage::AddHook(AddHookParams {
            hook: Hook(
                "/printer/files/(.*)".to_owned(),
                vec![ApiMethod::Get, ApiMethod::Delete],
                HookExtras {
                    handler: HandlerKind::StaticFile,
                    arg_parser: ArgParserKind::Default,
                    path: Some("/tmp/sdcard".to_owned()),
                },
            ),
        });
        let value = serde_json::to_value(&msg).expect("serialize add_hook");
        assert_eq!(
            value,
            serde_json::json!({
                "method": "add_hook",
                "params": {
                    "hook": [
                        "/printer/files/(.*)",
                        ["GET", "DELETE"],
                        {"handler": "static_file", "arg_parser": "default", "path": "/tmp/sdcard"},
                    ],
                },
            })
        );
        let back: HostMessage =
            serde_json::from_value(value).expect("add_hook should parse back");
        assert_eq!(back, msg);
    }

    #[test]
    fn load_config_ignores_unknown_keys_and_applies_defaults() {
        let raw = r#"{
            "method": "load_config",
            "params": {
                "config": {
                    "request_timeout": 7.5,
                    "api_key": "abc123",
                    "some_future_option": {"nested": true}
                }
            }
        }"#;
        let msg: HostMessage = serde_json::from_str(raw).expect("parse load_config");
        let HostMessage::LoadConfig(params) = msg else {
            panic!("expected load_config");
        };
        assert_eq!(params.config.request_timeout, 7.5);
        assert_eq!(params.config.api_key, "abc123");
        assert!(params.config.require_auth);
        assert!(!params.config.enable_cors);
        assert!(params.config.long_running_gcodes.is_empty());
    }

    #[test]
    fn set_klippy_shutdown_parses_with_empty_params() {
        let raw = r#"{"method":"set_klippy_shutdown","params":{}}"#;
        let msg: HostMessage = serde_json::from_str(raw).expect("parse shutdown");
        assert_eq!(msg, HostMessage::SetKlippyShutdown(KlippyShutdownParams {}));
    }

    #[test]
    fn server_error_recovers_from_error_response_with_default_code() {
        let value = serde_json::json!({"error": "ServerError", "message": "boom"});
        let err = ServerError::from_response(&value).expect("error payload");
        assert_eq!(err.message, "boom");
        assert_eq!(err.status_code, 400);

        let value = serde_json::json!({"error": "E", "message": "teapot", "status_code": 418});
        let err = ServerError::from_response(&value).expect("error payload");
        assert_eq!(err.status_code, 418);

        assert!(ServerError::from_response(&serde_json::json!({"result": 1})).is_none());
        assert!(ServerError::from_response(&serde_json::json!("ok")).is_none());
    }

    #[test]
    fn api_method_rejects_unknown_and_maps_case_forms() {
        assert_eq!("GET".parse::<ApiMethod>(), Ok(ApiMethod::Get));
        assert_eq!("DELETE".parse::<ApiMethod>(), Ok(ApiMethod::Delete));
        assert!("PUT".parse::<ApiMethod>().is_err());
        assert_eq!(ApiMethod::Post.lower(), "post");
        assert_eq!(ApiMethod::Post.as_str(), "POST");
    }
}
