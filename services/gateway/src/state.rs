use mr_protocol::{ApiMethod, ServerError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::auth::Authorization;
use crate::klippy::KlippyLink;
use crate::pending::PendingRequests;
use crate::registry::EndpointRegistry;
use crate::temperature::TemperatureStore;
use crate::ws::WsManager;

/// Shared gateway state threaded through every handler.
///
/// All cross-request state lives here; nothing is ambient. Cloning is cheap
/// (everything is behind an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EndpointRegistry>,
    pub pending: Arc<PendingRequests>,
    pub auth: Arc<Authorization>,
    pub klippy: Arc<KlippyLink>,
    pub ws: Arc<WsManager>,
    pub temps: Arc<TemperatureStore>,
    /// Toggled by `load_config`; read by the CORS predicate.
    pub cors_enabled: Arc<AtomicBool>,
    /// Log file served by `GET /server/moonraker.log`.
    pub logfile: PathBuf,
}

impl AppState {
    pub fn new(logfile: PathBuf) -> Self {
        AppState {
            registry: Arc::new(EndpointRegistry::new()),
            pending: Arc::new(PendingRequests::new()),
            auth: Arc::new(Authorization::new()),
            klippy: Arc::new(KlippyLink::new()),
            ws: Arc::new(WsManager::new()),
            temps: Arc::new(TemperatureStore::new()),
            cors_enabled: Arc::new(AtomicBool::new(false)),
            logfile,
        }
    }

    /// Endpoints the gateway answers itself, injected before the host has
    /// announced anything.
    pub async fn install_local_endpoints(&self) {
        use mr_protocol::{ArgParserKind, HandlerKind, Hook, HookExtras};

        let hooks = [
            Hook(
                "/machine/reboot".to_owned(),
                vec![ApiMethod::Post],
                HookExtras::default(),
            ),
            Hook(
                "/machine/shutdown".to_owned(),
                vec![ApiMethod::Post],
                HookExtras::default(),
            ),
            Hook(
                "/server/temperature_store".to_owned(),
                vec![ApiMethod::Get],
                HookExtras::default(),
            ),
            Hook(
                "/server/moonraker.log".to_owned(),
                vec![ApiMethod::Get],
                HookExtras {
                    handler: HandlerKind::StaticFile,
                    arg_parser: ArgParserKind::Default,
                    path: Some(self.logfile.to_string_lossy().into_owned()),
                },
            ),
        ];
        for hook in hooks {
            self.registry
                .register(&hook)
                .await
                .expect("local endpoint patterns are valid");
        }
    }

    /// Issue a request on behalf of a client and wait for its outcome.
    ///
    /// Local endpoints are answered in-process; everything else is
    /// correlated through the host socket with the effective per-endpoint
    /// timeout. This is the single entry point used by both the HTTP proxy
    /// handler and the JSON-RPC layer.
    pub async fn make_request(
        &self,
        path: &str,
        method: ApiMethod,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ServerError> {
        if let Some(result) = self.local_request(path).await {
            return result;
        }
        self.pending.roundtrip(&self.klippy, path, method, args).await
    }

    async fn local_request(
        &self,
        path: &str,
    ) -> Option<Result<serde_json::Value, ServerError>> {
        match path {
            "/machine/reboot" => Some(run_machine_command("reboot").await),
            "/machine/shutdown" => Some(run_machine_command("shutdown").await),
            "/server/temperature_store" => Some(Ok(self.temps.dump())),
            _ => None,
        }
    }

    /// Broadcast a host notification to every WebSocket as
    /// `notify_<name>`, recording temperatures on the way.
    pub async fn broadcast_notification(&self, name: &str, state: &serde_json::Value) {
        if name == "status_update" {
            self.temps.record_status(state);
        }
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": format!("notify_{name}"),
            "params": [state],
        });
        self.ws
            .broadcast(payload.to_string())
            .await;
    }

    /// Emit `filelist_changed` with a freshly fetched file list.
    ///
    /// The fetch is best-effort: when the host cannot produce a listing the
    /// notification still goes out with an empty one.
    pub fn notify_filelist_changed(&self, filename: String, action: &'static str) {
        let state = self.clone();
        tokio::spawn(async move {
            let filelist = match state
                .make_request("/printer/files", ApiMethod::Get, serde_json::json!({}))
                .await
            {
                Ok(list) => list,
                Err(_) => serde_json::json!([]),
            };
            let payload = serde_json::json!({
                "filename": filename,
                "action": action,
                "filelist": filelist,
            });
            state.broadcast_notification("filelist_changed", &payload).await;
        });
    }

    /// Start the periodic temperature sampler; idempotent across repeated
    /// `set_klippy_ready` messages.
    pub fn start_temperature_sampler(&self) {
        if self.temps.mark_sampler_running() {
            return;
        }
        let temps = self.temps.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(crate::temperature::TEMPERATURE_UPDATE_INTERVAL);
            loop {
                interval.tick().await;
                temps.sample();
            }
        });
    }

    /// Periodically expire trusted connections and stale one-shot tokens.
    pub fn start_auth_prune(&self) {
        let auth = self.auth.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(crate::auth::PRUNE_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                auth.prune();
            }
        });
    }

    /// Apply a `load_config` message from the host.
    pub fn load_config(&self, config: &mr_protocol::ServerConfig) {
        self.pending.load_timeouts(config);
        self.auth.load_config(config);
        self.cors_enabled
            .store(config.enable_cors, Ordering::Relaxed);
        info!(
            require_auth = config.require_auth,
            enable_cors = config.enable_cors,
            request_timeout = config.request_timeout,
            "configuration loaded from host"
        );
    }
}

async fn run_machine_command(action: &str) -> Result<serde_json::Value, ServerError> {
    info!(action = %action, "running machine command");
    let status = tokio::process::Command::new("sudo")
        .arg(action)
        .arg("now")
        .status()
        .await;
    if let Err(e) = status {
        return Err(ServerError::new(
            format!("Unable to run machine command: {e}"),
            500,
        ));
    }
    Ok(serde_json::json!("ok"))
}
