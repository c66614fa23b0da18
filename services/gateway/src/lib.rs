pub mod auth;
pub mod http;
pub mod jsonrpc;
pub mod klippy;
pub mod pending;
pub mod registry;
pub mod state;
pub mod temperature;
pub mod ws;

pub use state::AppState;

use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mr_protocol::{ApiMethod, HandlerKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::registry::RouteMatch;

/// Upload size cap: 200 MiB.
pub const MAX_UPLOAD_SIZE: usize = 200 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let cors_enabled = state.cors_enabled.clone();
    Router::new()
        .route("/websocket", get(ws::websocket_handler))
        .route("/api/version", get(api_version))
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE))
        .layer(cors_layer(cors_enabled))
        .with_state(state)
}

/// CORS is a runtime toggle (the host pushes `enable_cors` in its config),
/// so the layer decides per request instead of being baked in.
fn cors_layer(enabled: Arc<AtomicBool>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |_origin, _parts| {
            enabled.load(Ordering::Relaxed)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Run the shared authorization filter over the pieces of a request.
pub(crate) fn admit(
    state: &AppState,
    ip: Option<IpAddr>,
    headers: &HeaderMap,
    query: &[(String, String)],
) -> bool {
    let ip = ip.map(|ip| ip.to_string());
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let token = query
        .iter()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.as_str());
    state.auth.check(ip.as_deref(), api_key, token)
}

/// Emulates the version endpoint of a well-known third-party uploader so
/// existing slicer integrations can push files unmodified.
async fn api_version(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    if !admit(&state, Some(addr.ip()), &headers, &query) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    Json(serde_json::json!({
        "server": "1.1.1",
        "api": "0.1",
        "text": "OctoPrint Upload Emulator",
    }))
    .into_response()
}

/// Route every other path through the dynamic endpoint registry.
async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let query_pairs: Vec<(String, String)> = match Query::try_from_uri(req.uri()) {
        Ok(Query(pairs)) => pairs,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid Query String").into_response(),
    };
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    if !admit(&state, remote_ip, req.headers(), &query_pairs) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let Some(method) = api_method(req.method()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let path = req.uri().path().to_owned();

    match state.registry.resolve(&path, method).await {
        RouteMatch::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::Matched { endpoint, capture } => match endpoint.kind {
            HandlerKind::HostProxy => {
                http::proxy::handle(&state, &endpoint, &path, method, &query_pairs).await
            }
            HandlerKind::StaticFile => match method {
                ApiMethod::Delete => http::files::delete(&state, &endpoint, capture).await,
                _ => http::files::download(&endpoint, capture).await,
            },
            HandlerKind::FileUpload => {
                let multipart = match Multipart::from_request(req, &state).await {
                    Ok(multipart) => multipart,
                    Err(_) => {
                        return (StatusCode::BAD_REQUEST, "Bad Request, expected multipart")
                            .into_response()
                    }
                };
                http::files::upload(&state, &endpoint, &path, multipart).await
            }
            HandlerKind::AccessToken => {
                http::result_response(serde_json::json!(state.auth.create_oneshot_token()))
            }
        },
    }
}

fn api_method(method: &Method) -> Option<ApiMethod> {
    match *method {
        Method::GET => Some(ApiMethod::Get),
        Method::POST => Some(ApiMethod::Post),
        Method::DELETE => Some(ApiMethod::Delete),
        _ => None,
    }
}
