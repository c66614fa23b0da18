//! Host request correlation.
//!
//! Every proxied request gets a fresh id and a parked completion channel.
//! The host answers with `response` messages carrying `request_id`; the
//! correlator wakes exactly one waiter per id. A request that outlives its
//! deadline is removed and failed with 500; a response arriving after that
//! (or for an id the gateway never issued) is dropped with a log line.

use mr_protocol::{ApiMethod, GatewayRequest, ServerConfig, ServerError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

use crate::klippy::KlippyLink;

/// Base host round-trip timeout, overridable via `load_config`.
pub const DEFAULT_REQUEST_TIMEOUT: f64 = 5.0;

type Completion = oneshot::Sender<Result<serde_json::Value, ServerError>>;

#[derive(Debug, Default)]
struct TimeoutConfig {
    request_timeout: f64,
    long_running_requests: HashMap<String, f64>,
    long_running_gcodes: HashMap<String, f64>,
}

pub struct PendingRequests {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Completion>>,
    timeouts: Mutex<TimeoutConfig>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(TimeoutConfig {
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                long_running_requests: HashMap::new(),
                long_running_gcodes: HashMap::new(),
            }),
        }
    }

    pub fn load_timeouts(&self, config: &ServerConfig) {
        let mut timeouts = self.timeouts.lock().expect("timeout config lock");
        timeouts.request_timeout = config.request_timeout;
        timeouts.long_running_requests = config.long_running_requests.clone();
        timeouts.long_running_gcodes = config.long_running_gcodes.clone();
    }

    /// Effective deadline for one request.
    ///
    /// Per-path overrides apply first; for `/printer/gcode` the first
    /// whitespace-delimited token of `args.script` is then matched
    /// (case-insensitively) against the per-G-code table.
    pub fn effective_timeout(&self, path: &str, args: &serde_json::Value) -> Duration {
        let timeouts = self.timeouts.lock().expect("timeout config lock");
        let mut secs = timeouts
            .long_running_requests
            .get(path)
            .copied()
            .unwrap_or(timeouts.request_timeout);
        if path == "/printer/gcode" {
            let script = args
                .get("script")
                .and_then(|s| s.as_str())
                .unwrap_or_default();
            if let Some(base_gcode) = script.split_whitespace().next() {
                if let Some(&t) = timeouts
                    .long_running_gcodes
                    .get(&base_gcode.to_uppercase())
                {
                    secs = t;
                }
            }
        }
        Duration::from_secs_f64(secs)
    }

    /// Frame a request to the host and wait for its completion or timeout.
    pub async fn roundtrip(
        &self,
        klippy: &KlippyLink,
        path: &str,
        method: ApiMethod,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ServerError> {
        let timeout = self.effective_timeout(path, &args);
        let (id, rx) = self.register();
        let request = GatewayRequest {
            id,
            path: path.to_owned(),
            method,
            args,
        };
        let frame = serde_json::to_value(&request)
            .map_err(|e| ServerError::new(format!("request serialization: {e}"), 500))?;
        if klippy.send(&frame).await.is_err() {
            self.remove(id);
            return Err(ServerError::new("Klippy Host not connected", 503));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Completion sender dropped without firing: connection teardown
            // raced the registration.
            Ok(Err(_)) => Err(ServerError::new("Klippy Host not connected", 503)),
            Err(_) => {
                self.remove(id);
                info!(path = %path, method = %method, "host request timed out");
                Err(ServerError::new("Klippy Request Timed Out", 500))
            }
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<serde_json::Value, ServerError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.table.lock().expect("pending table lock").insert(id, tx);
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.table.lock().expect("pending table lock").remove(&id);
    }

    /// Deliver a host response to its waiter.
    ///
    /// A response object carrying an `error` key becomes the typed error;
    /// anything else is passed through untouched.
    pub fn complete(&self, request_id: u64, response: serde_json::Value) {
        let completion = self
            .table
            .lock()
            .expect("pending table lock")
            .remove(&request_id);
        let Some(completion) = completion else {
            info!(request_id, "no pending request matching host response");
            return;
        };
        let outcome = match ServerError::from_response(&response) {
            Some(err) => Err(err),
            None => Ok(response),
        };
        // The waiter may have timed out between removal and here; either way
        // delivery happens at most once.
        let _ = completion.send(outcome);
    }

    /// Fail every parked request, used when the host socket closes.
    pub fn fail_all(&self, error: &ServerError) {
        let drained: Vec<Completion> = self
            .table
            .lock()
            .expect("pending table lock")
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for completion in drained {
            let _ = completion.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.lock().expect("pending table lock").len()
    }
}
