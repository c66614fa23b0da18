//! Host (Klippy) connection handling.
//!
//! The gateway listens on a Unix-domain socket; the host dials in. At most
//! one host connection is active: a new connection displaces the previous
//! one, failing everything parked on it. Frames are NUL-delimited JSON
//! (see `mr_protocol::codec`); a malformed frame is logged and skipped
//! without tearing down the connection.

use futures_util::StreamExt;
use mr_protocol::codec::{encode_frame, NulCodec};
use mr_protocol::{HostMessage, ServerError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

use crate::state::AppState;

/// Short-write retry limit and pause, matching the host's own discipline.
const WRITE_RETRIES: u32 = 10;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);

fn not_connected() -> ServerError {
    ServerError::new("Klippy Host not connected", 503)
}

struct Connection {
    generation: u64,
    writer: OwnedWriteHalf,
}

/// The write half of the active host connection.
///
/// Readers run in their own task (`read_loop`); this handle only frames and
/// writes. The mutex gives the socket a single writer at a time.
pub struct KlippyLink {
    conn: Mutex<Option<Connection>>,
    generation: AtomicU64,
}

impl KlippyLink {
    pub fn new() -> Self {
        KlippyLink {
            conn: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Adopt a freshly accepted connection, displacing any previous one.
    ///
    /// Returns the connection's generation (used to pair `detach` with the
    /// right connection), the read half for the caller's reader task, and
    /// whether an earlier connection was displaced.
    pub async fn attach(&self, stream: UnixStream) -> (u64, OwnedReadHalf, bool) {
        let (read_half, writer) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.conn.lock().await;
        let displaced = guard.is_some();
        *guard = Some(Connection { generation, writer });
        (generation, read_half, displaced)
    }

    /// Drop the connection if `generation` is still the active one.
    ///
    /// Returns whether this call actually closed it; a displaced reader's
    /// late detach is a no-op.
    pub async fn detach(&self, generation: u64) -> bool {
        let mut guard = self.conn.lock().await;
        if guard
            .as_ref()
            .is_some_and(|c| c.generation == generation)
        {
            *guard = None;
            true
        } else {
            false
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Frame and write one value to the host.
    ///
    /// Short writes retry up to [`WRITE_RETRIES`] times with a
    /// [`WRITE_RETRY_PAUSE`] pause; exhausted retries or a hard error drop
    /// the write half, after which the reader task completes the teardown.
    pub async fn send(&self, value: &serde_json::Value) -> Result<(), ServerError> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(not_connected());
        };
        let frame = encode_frame(value);
        let mut written = 0;
        let mut retries = WRITE_RETRIES;
        while written < frame.len() {
            match conn.writer.try_write(&frame[written..]) {
                Ok(0) => {
                    warn!("zero-length write to host socket, closing");
                    *guard = None;
                    return Err(not_connected());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if retries == 0 {
                        warn!("host socket write retries exhausted, closing");
                        *guard = None;
                        return Err(not_connected());
                    }
                    retries -= 1;
                    tokio::time::sleep(WRITE_RETRY_PAUSE).await;
                }
                Err(e) => {
                    warn!(error = %e, "error writing to host socket, closing");
                    *guard = None;
                    return Err(not_connected());
                }
            }
        }
        Ok(())
    }
}

/// Bind the host socket, replacing a stale file from a previous run.
///
/// Split from [`run`] so startup can fail loudly on a bad socket path.
pub fn bind(socketfile: &Path) -> std::io::Result<UnixListener> {
    if socketfile.exists() {
        let _ = std::fs::remove_file(socketfile);
    }
    let listener = UnixListener::bind(socketfile)?;
    info!(socket = %socketfile.display(), "listening for Klippy host connection");
    Ok(listener)
}

/// Accept loop for the host socket; ends only if accept itself fails
/// (the process is shutting down at that point).
pub async fn run(state: AppState, listener: UnixListener) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "host socket accept failed");
                return;
            }
        };
        let (generation, read_half, displaced) = state.klippy.attach(stream).await;
        if displaced {
            info!("new host connection received while one is active, displacing");
            state.pending.fail_all(&not_connected());
            state
                .broadcast_notification("klippy_state_changed", &serde_json::json!("disconnect"))
                .await;
        }
        info!("Klippy connection established");
        tokio::spawn(read_loop(state.clone(), generation, read_half));
    }
}

async fn read_loop(state: AppState, generation: u64, read_half: OwnedReadHalf) {
    let mut frames = FramedRead::new(read_half, NulCodec);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match serde_json::from_slice::<HostMessage>(&bytes) {
                Ok(msg) => handle_host_message(&state, msg).await,
                Err(e) => {
                    warn!(error = %e, frame = %String::from_utf8_lossy(&bytes), "discarding unrecognized host frame");
                }
            },
            Err(e) => {
                warn!(error = %e, "host socket read error");
                break;
            }
        }
    }
    if state.klippy.detach(generation).await {
        info!("Klippy connection removed");
        state.pending.fail_all(&not_connected());
        state
            .broadcast_notification("klippy_state_changed", &serde_json::json!("disconnect"))
            .await;
    }
}

/// Dispatch one parsed host message.
pub async fn handle_host_message(state: &AppState, msg: HostMessage) {
    match msg {
        HostMessage::Response(params) => {
            state.pending.complete(params.request_id, params.response);
        }
        HostMessage::Notification(params) => {
            state.broadcast_notification(&params.name, &params.state).await;
        }
        HostMessage::AddHook(params) => {
            if let Err(e) = state.registry.register(&params.hook).await {
                warn!(pattern = %params.hook.path(), error = %e, "rejecting endpoint registration");
            }
        }
        HostMessage::LoadConfig(params) => {
            state.load_config(&params.config);
        }
        HostMessage::SetKlippyReady(params) => {
            info!(sensors = ?params.sensors, "Klippy ready");
            state.temps.set_sensors(&params.sensors);
            state.start_temperature_sampler();
            state
                .broadcast_notification("klippy_state_changed", &serde_json::json!("ready"))
                .await;
        }
        HostMessage::SetKlippyShutdown(_) => {
            info!("Klippy has shut down");
            state
                .broadcast_notification("klippy_state_changed", &serde_json::json!("shutdown"))
                .await;
        }
    }
}
