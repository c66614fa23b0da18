//! Client side of the framed gateway socket.
//!
//! The host dials the gateway's Unix socket, replays its endpoint manifest,
//! and from then on answers gateway requests and pushes notifications.
//! Framing matches the gateway side: NUL-delimited JSON, short writes
//! retried with a small pause.

use futures_util::StreamExt;
use mr_protocol::codec::{encode_frame, NulCodec};
use mr_protocol::{
    AddHookParams, ApiMethod, GatewayRequest, HookExtras, HostMessage, KlippyReadyParams,
    KlippyShutdownParams, LoadConfigParams, NotificationParams, ServerConfig, ServerError,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{EndpointHandler, WebHooks};

const WRITE_RETRIES: u32 = 10;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// An established connection to the gateway.
pub struct HostLink {
    hooks: Arc<WebHooks>,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
}

impl HostLink {
    /// Dial the gateway and replay the current endpoint manifest.
    pub async fn connect(socket_path: &Path, hooks: Arc<WebHooks>) -> std::io::Result<Arc<Self>> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let link = Arc::new(HostLink {
            hooks,
            writer: Mutex::new(write_half),
            connected: AtomicBool::new(true),
        });
        tokio::spawn(read_loop(link.clone(), read_half));
        info!(socket = %socket_path.display(), "gateway connection established");
        for hook in link.hooks.hooks() {
            link.send_message(&HostMessage::AddHook(AddHookParams { hook }))
                .await?;
        }
        Ok(link)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Register an endpoint and announce it immediately.
    pub async fn register_endpoint(
        &self,
        path: &str,
        methods: Vec<ApiMethod>,
        extras: HookExtras,
        handler: EndpointHandler,
    ) -> Result<(), ServerError> {
        let hook = self.hooks.register_endpoint(path, methods, extras, handler)?;
        self.send_message(&HostMessage::AddHook(AddHookParams { hook }))
            .await
            .map_err(|e| ServerError::new(format!("gateway send failed: {e}"), 503))
    }

    pub async fn send_notification(
        &self,
        name: &str,
        state: serde_json::Value,
    ) -> std::io::Result<()> {
        self.send_message(&HostMessage::Notification(NotificationParams {
            name: name.to_owned(),
            state,
        }))
        .await
    }

    pub async fn load_config(&self, config: ServerConfig) -> std::io::Result<()> {
        self.send_message(&HostMessage::LoadConfig(LoadConfigParams { config }))
            .await
    }

    pub async fn set_klippy_ready(&self, sensors: Vec<String>) -> std::io::Result<()> {
        self.send_message(&HostMessage::SetKlippyReady(KlippyReadyParams { sensors }))
            .await
    }

    pub async fn set_klippy_shutdown(&self) -> std::io::Result<()> {
        self.send_message(&HostMessage::SetKlippyShutdown(KlippyShutdownParams {}))
            .await
    }

    pub async fn send_message(&self, msg: &HostMessage) -> std::io::Result<()> {
        let value = serde_json::to_value(msg)?;
        self.send(&value).await
    }

    /// Frame and write one value, with the shared retry discipline.
    pub async fn send(&self, value: &serde_json::Value) -> std::io::Result<()> {
        if !self.is_connected() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "gateway not connected",
            ));
        }
        let frame = encode_frame(value);
        let writer = self.writer.lock().await;
        let mut written = 0;
        let mut retries = WRITE_RETRIES;
        while written < frame.len() {
            match writer.try_write(&frame[written..]) {
                Ok(0) => {
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if retries == 0 {
                        warn!("gateway socket write retries exhausted, closing");
                        self.connected.store(false, Ordering::Relaxed);
                        return Err(e);
                    }
                    retries -= 1;
                    tokio::time::sleep(WRITE_RETRY_PAUSE).await;
                }
                Err(e) => {
                    warn!(error = %e, "error writing to gateway socket, closing");
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

async fn read_loop(link: Arc<HostLink>, read_half: OwnedReadHalf) {
    let mut frames = FramedRead::new(read_half, NulCodec);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match serde_json::from_slice::<GatewayRequest>(&bytes) {
                Ok(request) => {
                    debug!(path = %request.path, id = request.id, "gateway request received");
                    let response = link.hooks.dispatch(request);
                    let msg = HostMessage::Response(response);
                    if link.send_message(&msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "discarding unrecognized gateway frame");
                }
            },
            Err(e) => {
                warn!(error = %e, "gateway socket read error");
                break;
            }
        }
    }
    link.connected.store(false, Ordering::Relaxed);
    info!("lost connection to gateway");
}
