//! Dynamic endpoint registry.
//!
//! Endpoints are announced by the host at runtime via `add_hook` manifests
//! (plus a handful of local ones injected at startup), so routing cannot be
//! baked into the router: incoming paths fall through to a dispatcher that
//! resolves them here. Re-registering a pattern replaces the previous rule.
//!
//! Patterns containing a capture group are compiled as anchored regexes and
//! expose their first capture (the file path for static handlers);
//! everything else matches literally.

use mr_protocol::{ApiMethod, ArgParserKind, HandlerKind, Hook, ServerError};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone)]
enum PathMatcher {
    Literal(String),
    Pattern(regex::Regex),
}

impl PathMatcher {
    /// `None` on no match; `Some(capture)` on match, with the first capture
    /// group when the pattern has one.
    fn matches(&self, path: &str) -> Option<Option<String>> {
        match self {
            PathMatcher::Literal(literal) => (literal == path).then_some(None),
            PathMatcher::Pattern(re) => re
                .captures(path)
                .map(|caps| caps.get(1).map(|m| m.as_str().to_owned())),
        }
    }
}

/// One routing rule, identified by its original pattern text.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub pattern: String,
    matcher: PathMatcher,
    pub methods: Vec<ApiMethod>,
    pub kind: HandlerKind,
    pub arg_parser: ArgParserKind,
    /// Filesystem root (or single file) for static/upload handlers.
    pub static_path: Option<PathBuf>,
}

/// Outcome of resolving an incoming path.
#[derive(Debug)]
pub enum RouteMatch {
    Matched {
        endpoint: Endpoint,
        /// First regex capture, when the pattern has one.
        capture: Option<String>,
    },
    MethodNotAllowed,
    NotFound,
}

pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Endpoint>>,
    /// JSON-RPC method name -> (path, method), host-proxy endpoints only.
    rpc_methods: RwLock<HashMap<String, (String, ApiMethod)>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        EndpointRegistry {
            endpoints: RwLock::new(Vec::new()),
            rpc_methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the endpoint described by a hook manifest.
    pub async fn register(&self, hook: &Hook) -> Result<(), ServerError> {
        let endpoint = Endpoint {
            pattern: hook.path().to_owned(),
            matcher: compile_matcher(hook.path())?,
            methods: hook.methods().to_vec(),
            kind: hook.extras().handler,
            arg_parser: hook.extras().arg_parser,
            static_path: hook.extras().path.as_ref().map(PathBuf::from),
        };
        info!(
            pattern = %endpoint.pattern,
            methods = ?endpoint.methods,
            handler = ?endpoint.kind,
            "registering endpoint"
        );

        {
            let mut rpc = self.rpc_methods.write().await;
            rpc.retain(|_, target| target.0 != hook.path());
            if endpoint.kind == HandlerKind::HostProxy {
                for &method in &endpoint.methods {
                    rpc.insert(
                        rpc_method_name(method, hook.path()),
                        (hook.path().to_owned(), method),
                    );
                }
            }
        }

        let mut endpoints = self.endpoints.write().await;
        match endpoints.iter_mut().find(|e| e.pattern == endpoint.pattern) {
            Some(existing) => *existing = endpoint,
            None => endpoints.push(endpoint),
        }
        Ok(())
    }

    /// Resolve an incoming path and method to an endpoint.
    ///
    /// The first matching rule wins in registration order; a path that
    /// matches only with a disallowed method reports 405 over 404.
    pub async fn resolve(&self, path: &str, method: ApiMethod) -> RouteMatch {
        let endpoints = self.endpoints.read().await;
        let mut method_mismatch = false;
        for endpoint in endpoints.iter() {
            if let Some(capture) = endpoint.matcher.matches(path) {
                if endpoint.methods.contains(&method) {
                    return RouteMatch::Matched {
                        endpoint: endpoint.clone(),
                        capture,
                    };
                }
                method_mismatch = true;
            }
        }
        if method_mismatch {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    /// Look up the target of a JSON-RPC method name.
    pub async fn rpc_target(&self, name: &str) -> Option<(String, ApiMethod)> {
        self.rpc_methods.read().await.get(name).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

/// JSON-RPC name for a host-proxy endpoint: lowercase HTTP method, then the
/// path with slashes mapped to underscores (`post_printer_gcode`).
pub fn rpc_method_name(method: ApiMethod, path: &str) -> String {
    format!("{}{}", method.lower(), path.replace('/', "_"))
}

fn compile_matcher(pattern: &str) -> Result<PathMatcher, ServerError> {
    if pattern.contains('(') {
        let re = regex::Regex::new(&format!("^{pattern}$"))
            .map_err(|e| ServerError::new(format!("invalid endpoint pattern: {e}"), 500))?;
        Ok(PathMatcher::Pattern(re))
    } else {
        Ok(PathMatcher::Literal(pattern.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mr_protocol::HookExtras;

    fn hook(path: &str, methods: &[ApiMethod], extras: HookExtras) -> Hook {
        Hook(path.to_owned(), methods.to_vec(), extras)
    }

    async fn registry_with(hooks: &[Hook]) -> EndpointRegistry {
        let registry = EndpointRegistry::new();
        for h in hooks {
            registry.register(h).await.expect("valid hook");
        }
        registry
    }

    #[tokio::test]
    async fn literal_paths_match_exactly() {
        let registry = registry_with(&[hook(
            "/printer/objects",
            &[ApiMethod::Get],
            HookExtras::default(),
        )])
        .await;

        match registry.resolve("/printer/objects", ApiMethod::Get).await {
            RouteMatch::Matched { endpoint, capture } => {
                assert_eq!(endpoint.pattern, "/printer/objects");
                assert_eq!(capture, None);
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert!(matches!(
            registry.resolve("/printer/objectsx", ApiMethod::Get).await,
            RouteMatch::NotFound
        ));
        // A dot in a literal path is a dot, not a regex wildcard.
        let registry = registry_with(&[hook(
            "/server/moonraker.log",
            &[ApiMethod::Get],
            HookExtras::default(),
        )])
        .await;
        assert!(matches!(
            registry.resolve("/server/moonrakerXlog", ApiMethod::Get).await,
            RouteMatch::NotFound
        ));
    }

    #[tokio::test]
    async fn capture_patterns_expose_the_matched_segment() {
        let registry = registry_with(&[hook(
            "/printer/files/(.*)",
            &[ApiMethod::Get, ApiMethod::Delete],
            HookExtras {
                handler: HandlerKind::StaticFile,
                path: Some("/tmp/sdcard".to_owned()),
                ..HookExtras::default()
            },
        )])
        .await;

        match registry
            .resolve("/printer/files/sub/part.gcode", ApiMethod::Get)
            .await
        {
            RouteMatch::Matched { capture, .. } => {
                assert_eq!(capture.as_deref(), Some("sub/part.gcode"));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn method_mismatch_reports_405_over_404() {
        let registry = registry_with(&[hook(
            "/printer/gcode",
            &[ApiMethod::Post],
            HookExtras::default(),
        )])
        .await;
        assert!(matches!(
            registry.resolve("/printer/gcode", ApiMethod::Get).await,
            RouteMatch::MethodNotAllowed
        ));
        assert!(matches!(
            registry.resolve("/nowhere", ApiMethod::Get).await,
            RouteMatch::NotFound
        ));
    }

    #[tokio::test]
    async fn reregistering_a_pattern_replaces_the_prior_rule() {
        let registry = registry_with(&[hook(
            "/printer/status",
            &[ApiMethod::Get],
            HookExtras::default(),
        )])
        .await;
        registry
            .register(&hook(
                "/printer/status",
                &[ApiMethod::Get, ApiMethod::Post],
                HookExtras {
                    arg_parser: ArgParserKind::Status,
                    ..HookExtras::default()
                },
            ))
            .await
            .expect("valid hook");

        assert_eq!(registry.len().await, 1);
        match registry.resolve("/printer/status", ApiMethod::Post).await {
            RouteMatch::Matched { endpoint, .. } => {
                assert_eq!(endpoint.arg_parser, ArgParserKind::Status);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rpc_names_follow_host_proxy_endpoints_only() {
        let registry = registry_with(&[
            hook(
                "/printer/gcode",
                &[ApiMethod::Post],
                HookExtras::default(),
            ),
            hook(
                "/printer/files/(.*)",
                &[ApiMethod::Get],
                HookExtras {
                    handler: HandlerKind::StaticFile,
                    path: Some("/tmp/sdcard".to_owned()),
                    ..HookExtras::default()
                },
            ),
        ])
        .await;

        assert_eq!(
            registry.rpc_target("post_printer_gcode").await,
            Some(("/printer/gcode".to_owned(), ApiMethod::Post))
        );
        assert_eq!(registry.rpc_target("get_printer_files_(.*)").await, None);

        // Replacement drops RPC names for methods no longer announced.
        registry
            .register(&hook(
                "/printer/gcode",
                &[ApiMethod::Get],
                HookExtras::default(),
            ))
            .await
            .expect("valid hook");
        assert_eq!(registry.rpc_target("post_printer_gcode").await, None);
        assert_eq!(
            registry.rpc_target("get_printer_gcode").await,
            Some(("/printer/gcode".to_owned(), ApiMethod::Get))
        );
    }

    #[test]
    fn rpc_method_name_maps_slashes_to_underscores() {
        assert_eq!(
            rpc_method_name(ApiMethod::Post, "/printer/print/pause"),
            "post_printer_print_pause"
        );
    }
}
