//! WebSocket manager and handler.
//!
//! Upgrades are admitted through the same authorization filter as HTTP.
//! Each socket gets a dedicated writer task fed by an unbounded channel, so
//! notification fan-out preserves per-socket ordering without blocking on a
//! slow peer's TCP window. The socket set is iterated in id order (ids are
//! monotonic), which is registration order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::jsonrpc;
use crate::state::AppState;

pub struct WsManager {
    next_id: AtomicU64,
    sockets: Mutex<BTreeMap<u64, mpsc::UnboundedSender<Message>>>,
}

impl WsManager {
    pub fn new() -> Self {
        WsManager {
            next_id: AtomicU64::new(1),
            sockets: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn add(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets.lock().await.insert(id, tx);
        info!(ws_id = id, "new websocket added");
        id
    }

    pub async fn remove(&self, id: u64) {
        if self.sockets.lock().await.remove(&id).is_some() {
            info!(ws_id = id, "websocket removed");
        }
    }

    /// Send `data` to every open socket, in registration order.
    ///
    /// Delivery is best-effort: a failed enqueue means the socket is going
    /// away and its own task handles removal.
    pub async fn broadcast(&self, data: String) {
        let sockets = self.sockets.lock().await;
        for (id, tx) in sockets.iter() {
            if tx.send(Message::Text(data.clone().into())).is_err() {
                warn!(ws_id = id, "error sending data over websocket");
            }
        }
    }

    /// Number of currently tracked sockets.
    pub async fn len(&self) -> usize {
        self.sockets.lock().await.len()
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    if !crate::admit(&state, Some(addr.ip()), &headers, &query) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.ws.add(tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(response) = jsonrpc::dispatch(&state, text.as_str()).await {
                    if tx.send(Message::Text(response.into())).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.ws.remove(id).await;
    writer.abort();
}
