//! Host-resident half of the gateway protocol.
//!
//! The gateway never routes by itself: the host registers its endpoints
//! here and a manifest is pushed over the socket whenever the connection is
//! up. Incoming gateway requests are dispatched to the registered callbacks
//! and answered with `response` messages.
//!
//! The crate also carries the host-side contracts the gateway depends on:
//! the subscription tick wheel ([`status`]) and API-key persistence
//! ([`apikey`]).

use mr_protocol::{ApiMethod, GatewayRequest, Hook, HookExtras, ResponseParams, ServerConfig, ServerError};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

pub mod apikey;
pub mod connection;
pub mod status;

pub use connection::HostLink;

// ---------------------------------------------------------------------------
// WebRequest
// ---------------------------------------------------------------------------

/// One gateway request as seen by an endpoint callback.
///
/// A callback either stores a response with [`send`](WebRequest::send) or
/// returns an error; a callback that does neither acknowledges with `"ok"`.
#[derive(Debug)]
pub struct WebRequest {
    id: u64,
    path: String,
    method: ApiMethod,
    args: serde_json::Value,
    response: Option<serde_json::Value>,
}

impl From<GatewayRequest> for WebRequest {
    fn from(req: GatewayRequest) -> Self {
        WebRequest {
            id: req.id,
            path: req.path,
            method: req.method,
            args: req.args,
            response: None,
        }
    }
}

impl WebRequest {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> ApiMethod {
        self.method
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    /// Fetch a required string argument.
    pub fn get_str(&self, name: &str) -> Result<&str, ServerError> {
        self.args
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServerError::new(format!("Invalid Argument [{name}]"), 400))
    }

    /// Store the response value. Later calls replace earlier ones.
    pub fn send(&mut self, value: serde_json::Value) {
        self.response = Some(value);
    }

    fn finish(self, error: Option<ServerError>) -> ResponseParams {
        let response = match error {
            Some(err) => err.to_wire(),
            None => self.response.unwrap_or_else(|| serde_json::json!("ok")),
        };
        ResponseParams {
            request_id: self.id,
            response,
        }
    }
}

// ---------------------------------------------------------------------------
// WebHooks registry
// ---------------------------------------------------------------------------

/// Endpoint callback. Callbacks run on the connection's reader task and
/// must not block.
pub type EndpointHandler =
    std::sync::Arc<dyn Fn(&mut WebRequest) -> Result<(), ServerError> + Send + Sync>;

#[derive(Default)]
struct HooksInner {
    endpoints: HashMap<String, EndpointHandler>,
    hooks: Vec<Hook>,
}

/// Local endpoint registry; its manifest is replayed to the gateway on
/// every (re)connect.
#[derive(Default)]
pub struct WebHooks {
    inner: Mutex<HooksInner>,
}

impl WebHooks {
    pub fn new() -> Self {
        WebHooks::default()
    }

    /// Register an endpoint. A path may only be registered once per host
    /// lifetime; the gateway-side replacement rule exists for reconnects,
    /// not for live rebinding.
    pub fn register_endpoint(
        &self,
        path: &str,
        methods: Vec<ApiMethod>,
        extras: HookExtras,
        handler: EndpointHandler,
    ) -> Result<Hook, ServerError> {
        let mut inner = self.inner.lock().expect("hooks lock");
        if inner.endpoints.contains_key(path) {
            return Err(ServerError::new("Path already registered to an endpoint", 400));
        }
        info!(path = %path, methods = ?methods, "registering webhook endpoint");
        inner.endpoints.insert(path.to_owned(), handler);
        let hook = Hook(path.to_owned(), methods, extras);
        inner.hooks.push(hook.clone());
        Ok(hook)
    }

    /// The full manifest, in registration order.
    pub fn hooks(&self) -> Vec<Hook> {
        self.inner.lock().expect("hooks lock").hooks.clone()
    }

    /// Run one gateway request through its callback.
    pub fn dispatch(&self, request: GatewayRequest) -> ResponseParams {
        let handler = self
            .inner
            .lock()
            .expect("hooks lock")
            .endpoints
            .get(&request.path)
            .cloned();
        let mut web_request = WebRequest::from(request);
        let error = match handler {
            Some(handler) => handler(&mut web_request).err(),
            None => Some(ServerError::new(
                format!("No registered callback for path '{}'", web_request.path()),
                404,
            )),
        };
        web_request.finish(error)
    }
}

// ---------------------------------------------------------------------------
// Server configuration assembly
// ---------------------------------------------------------------------------

/// Base gateway configuration with the built-in long-running request table.
pub fn base_server_config(api_key: &str) -> ServerConfig {
    let long_running_requests = [
        "/printer/gcode",
        "/printer/print/pause",
        "/printer/print/resume",
        "/printer/print/cancel",
    ]
    .into_iter()
    .map(|path| (path.to_owned(), 60.0))
    .collect();
    ServerConfig {
        long_running_requests,
        api_key: api_key.to_owned(),
        ..ServerConfig::default()
    }
}

/// Split a `trusted_clients` list into literal IPs and /24 range prefixes.
///
/// Ranges must be written `A.B.C.0/24` and are stored as their first three
/// octets; anything else is a configuration error.
pub fn classify_trusted_clients(
    clients: &[String],
) -> Result<(Vec<String>, Vec<String>), ServerError> {
    let octet = r"([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])";
    let ip_regex = regex::Regex::new(&format!(r"^({octet}\.){{3}}{octet}$"))
        .expect("static regex compiles");
    let range_regex = regex::Regex::new(&format!(r"^({octet}\.){{3}}0/24$"))
        .expect("static regex compiles");

    let mut trusted_ips = Vec::new();
    let mut trusted_ranges = Vec::new();
    for client in clients {
        if ip_regex.is_match(client) {
            trusted_ips.push(client.clone());
        } else if range_regex.is_match(client) {
            let prefix = &client[..client.rfind('.').expect("range contains dots")];
            trusted_ranges.push(prefix.to_owned());
        } else {
            return Err(ServerError::new(
                format!("Unknown value in trusted_clients option, {client}"),
                400,
            ));
        }
    }
    Ok((trusted_ips, trusted_ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(path: &str, args: serde_json::Value) -> GatewayRequest {
        GatewayRequest {
            id: 1,
            path: path.to_owned(),
            method: ApiMethod::Get,
            args,
        }
    }

    #[test]
    fn dispatch_returns_callback_response() {
        let hooks = WebHooks::new();
        hooks
            .register_endpoint(
                "/printer/objects",
                vec![ApiMethod::Get],
                HookExtras::default(),
                Arc::new(|req| {
                    req.send(serde_json::json!({"toolhead": ["position"]}));
                    Ok(())
                }),
            )
            .expect("register");

        let response = hooks.dispatch(request("/printer/objects", serde_json::json!({})));
        assert_eq!(response.request_id, 1);
        assert_eq!(response.response, serde_json::json!({"toolhead": ["position"]}));
    }

    #[test]
    fn dispatch_defaults_to_ok_and_wraps_errors() {
        let hooks = WebHooks::new();
        hooks
            .register_endpoint(
                "/printer/print/start",
                vec![ApiMethod::Post],
                HookExtras::default(),
                Arc::new(|_req| Ok(())),
            )
            .expect("register");
        hooks
            .register_endpoint(
                "/printer/gcode",
                vec![ApiMethod::Post],
                HookExtras::default(),
                Arc::new(|req| {
                    let _script = req.get_str("script")?;
                    Ok(())
                }),
            )
            .expect("register");

        let ok = hooks.dispatch(request("/printer/print/start", serde_json::json!({})));
        assert_eq!(ok.response, serde_json::json!("ok"));

        let err = hooks.dispatch(request("/printer/gcode", serde_json::json!({})));
        let err = ServerError::from_response(&err.response).expect("error payload");
        assert_eq!(err.message, "Invalid Argument [script]");
        assert_eq!(err.status_code, 400);

        let missing = hooks.dispatch(request("/nope", serde_json::json!({})));
        let err = ServerError::from_response(&missing.response).expect("error payload");
        assert_eq!(err.status_code, 404);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let hooks = WebHooks::new();
        let handler: EndpointHandler = Arc::new(|_req| Ok(()));
        hooks
            .register_endpoint("/a", vec![ApiMethod::Get], HookExtras::default(), handler.clone())
            .expect("first registration");
        assert!(hooks
            .register_endpoint("/a", vec![ApiMethod::Get], HookExtras::default(), handler)
            .is_err());
    }

    #[test]
    fn base_config_seeds_long_running_paths_at_sixty_seconds() {
        let config = base_server_config("key");
        assert_eq!(config.request_timeout, 5.0);
        for path in [
            "/printer/gcode",
            "/printer/print/pause",
            "/printer/print/resume",
            "/printer/print/cancel",
        ] {
            assert_eq!(config.long_running_requests.get(path), Some(&60.0));
        }
        assert_eq!(config.api_key, "key");
    }

    #[test]
    fn trusted_clients_split_into_ips_and_range_prefixes() {
        let (ips, ranges) = classify_trusted_clients(&[
            "127.0.0.1".to_owned(),
            "192.168.1.0/24".to_owned(),
        ])
        .expect("valid clients");
        assert_eq!(ips, vec!["127.0.0.1"]);
        assert_eq!(ranges, vec!["192.168.1"]);

        assert!(classify_trusted_clients(&["192.168.1.5/24".to_owned()]).is_err());
        assert!(classify_trusted_clients(&["300.0.0.1".to_owned()]).is_err());
        assert!(classify_trusted_clients(&["not-an-ip".to_owned()]).is_err());
    }
}
