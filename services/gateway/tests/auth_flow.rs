//! Authorization paths over real HTTP: API key, trusted IPs, and one-shot
//! access tokens.

use gateway::{build_router, klippy, AppState};
use mr_protocol::{ApiMethod, HandlerKind, Hook, HookExtras, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;

const API_KEY: &str = "0123456789abcdef0123456789abcdef";

async fn spawn_gateway(dir: &Path) -> (AppState, String) {
    let logfile = dir.join("moonraker.log");
    std::fs::write(&logfile, "log\n").expect("seed log file");
    let state = AppState::new(logfile);
    state.install_local_endpoints().await;

    let socket_path = dir.join("moonraker.sock");
    let host_listener = klippy::bind(&socket_path).expect("bind host socket");
    tokio::spawn(klippy::run(state.clone(), host_listener));

    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http listener");
    let base_url = format!("http://{}", tcp.local_addr().expect("local addr"));
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(tcp, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("serve");
    });
    (state, base_url)
}

fn keyed_config() -> ServerConfig {
    ServerConfig {
        api_key: API_KEY.to_owned(),
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn requests_without_credentials_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (state, base_url) = spawn_gateway(dir.path()).await;
    state.load_config(&keyed_config());

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/api/version"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!("{base_url}/server/temperature_store"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn api_key_header_admits_requests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (state, base_url) = spawn_gateway(dir.path()).await;
    state.load_config(&keyed_config());

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/server/temperature_store"))
        .header("X-Api-Key", API_KEY)
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client
        .get(format!("{base_url}/server/temperature_store"))
        .header("X-Api-Key", "wrong-key")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn trusted_ip_is_admitted_and_cached_without_a_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (state, base_url) = spawn_gateway(dir.path()).await;
    state.load_config(&ServerConfig {
        api_key: API_KEY.to_owned(),
        trusted_ips: vec!["127.0.0.1".to_owned()],
        ..ServerConfig::default()
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/server/temperature_store"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn trusted_range_admits_the_whole_slash_24() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (state, base_url) = spawn_gateway(dir.path()).await;
    state.load_config(&ServerConfig {
        api_key: API_KEY.to_owned(),
        trusted_ranges: vec!["127.0.0".to_owned()],
        ..ServerConfig::default()
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/api/version"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn oneshot_token_admits_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (state, base_url) = spawn_gateway(dir.path()).await;
    state.load_config(&keyed_config());

    // The token endpoint is normally announced by the host.
    state
        .registry
        .register(&Hook(
            "/access/oneshot_token".to_owned(),
            vec![ApiMethod::Get],
            HookExtras {
                handler: HandlerKind::AccessToken,
                ..HookExtras::default()
            },
        ))
        .await
        .expect("register");

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base_url}/access/oneshot_token"))
        .header("X-Api-Key", API_KEY)
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json body");
    let token = body["result"].as_str().expect("token string").to_owned();
    assert!(!token.is_empty());

    let url = format!("{base_url}/api/version?token={token}");
    let response = client.get(&url).send().await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Second use of the same token fails.
    let response = client.get(&url).send().await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}
