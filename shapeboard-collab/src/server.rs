//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Peer A ──┐  ws://host:port/<room>
//!          ├── Room (name) ── ShapeStore replica ── BroadcastGroup
//! Peer B ──┘                        │
//!                          ┌────────┼────────┐
//!                          ▼        ▼        ▼
//!                       Peer A   Peer B   Peer C   (never the sender)
//! ```
//!
//! The relay is just another replica: it merges every update it forwards so
//! that a peer joining an otherwise empty room still gets the document via
//! the normal handshake. It does not interpret shapes.
//!
//! Requests that are not WebSocket upgrades get the plain-text liveness
//! response, on any path and method.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage};
use crate::room::{Room, RoomManager, DEFAULT_ROOM};

/// Body of the liveness response.
pub const HEALTH_BODY: &str = "okay";

type WsSink = SplitSink<WebSocket, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Drop a room's replica once its last peer leaves
    pub evict_empty_rooms: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1234".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            evict_empty_rooms: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames dropped because they failed to decode or merge
    pub rejected_messages: u64,
    /// Full-state resends to peers that fell behind the broadcast buffer
    pub resyncs: u64,
    pub active_rooms: usize,
    pub health_checks: u64,
}

/// The relay server. Cloning shares the rooms and statistics.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
            config.evict_empty_rooms,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Failed accepts are logged and retried by `axum::serve`; they do not
    /// end the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    /// Routes: `/` joins the default room, `/{room}` joins `room`, and
    /// every other request gets the liveness body.
    ///
    /// Needs `ConnectInfo<SocketAddr>`, so serve it with
    /// `into_make_service_with_connect_info`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(default_room_handler))
            .route("/:room", any(room_handler))
            .fallback(health_handler)
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    async fn upgrade_or_answer(
        self,
        ws: Option<WebSocketUpgrade>,
        room: String,
        addr: SocketAddr,
    ) -> Response {
        match ws {
            Some(ws) => ws.on_upgrade(move |socket| async move {
                if let Err(e) = self.handle_socket(socket, addr, room).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            }),
            None => self.liveness(addr).await,
        }
    }

    async fn liveness(&self, addr: SocketAddr) -> Response {
        log::debug!("Liveness request from {addr}");
        self.stats.write().await.health_checks += 1;
        HEALTH_BODY.into_response()
    }

    async fn handle_socket(
        &self,
        socket: WebSocket,
        addr: SocketAddr,
        room_name: String,
    ) -> Result<(), SyncError> {
        let peer = Uuid::new_v4();
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.run_peer(socket, addr, &room_name, peer).await;

        let mut s = self.stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = self.rooms.room_count().await;
        result
    }

    async fn run_peer(
        &self,
        socket: WebSocket,
        addr: SocketAddr,
        room_name: &str,
        peer: Uuid,
    ) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let (room, joined) = match self.rooms.join(room_name, peer).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Refusing {addr}: {e}");
                let close = CloseFrame {
                    code: close_code::AGAIN,
                    reason: Cow::Owned(e.to_string()),
                };
                ws_sender.send(Message::Close(Some(close))).await?;
                return Ok(());
            }
        };
        self.stats.write().await.active_rooms = self.rooms.room_count().await;
        log::info!("Peer {peer} ({addr}) joined room '{room_name}'");

        let mut broadcast_rx = joined.receiver;
        let result = async {
            // Ask for anything the peer has that the relay lacks.
            let step1 = SyncMessage::sync_step1(Uuid::nil(), joined.state_vector);
            send_frame(&mut ws_sender, step1.encode()?).await?;

            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                self.handle_frame(&room, peer, &data, &mut ws_sender).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    // Frames relayed from other peers of the room
                    relayed = broadcast_rx.recv() => {
                        match relayed {
                            Ok(envelope) => {
                                if envelope.is_from(peer) {
                                    continue;
                                }
                                send_frame(&mut ws_sender, envelope.frame.to_vec()).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer} lagged by {n} frames, resending full state");
                                self.stats.write().await.resyncs += 1;
                                let full = SyncMessage::sync_step2(Uuid::nil(), room.full_state().await);
                                send_frame(&mut ws_sender, full.encode()?).await?;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), SyncError>(())
        }
        .await;

        drop(broadcast_rx);
        let relayed = room.stats().await;
        if self.rooms.leave(&room, &peer).await {
            log::info!("Room '{room_name}' dropped its replica");
        }
        log::info!(
            "Peer {peer} left room '{room_name}' ({} frames relayed, {} deliveries)",
            relayed.messages_sent,
            relayed.deliveries
        );
        result
    }

    /// Handle one binary frame from `peer`.
    ///
    /// Bad frames are logged and dropped; only socket failures end the
    /// connection.
    async fn handle_frame(
        &self,
        room: &Room,
        peer: Uuid,
        data: &[u8],
        ws_sender: &mut WsSink,
    ) -> Result<(), SyncError> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += data.len() as u64;
        }

        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                self.reject(peer, &e.to_string()).await;
                return Ok(());
            }
        };

        if !msg.carries_update() {
            match room.diff(&msg.payload).await {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(Uuid::nil(), diff);
                    send_frame(ws_sender, reply.encode()?).await?;
                }
                Err(e) => self.reject(peer, &e.to_string()).await,
            }
            return Ok(());
        }

        // Deltas go out byte-for-byte; a step-2 answer is news to the other
        // peers, so it is re-framed as a delta.
        let frame = if msg.msg_type == MessageType::Delta {
            data.to_vec()
        } else {
            SyncMessage::delta(msg.peer_id, msg.payload.clone()).encode()?
        };
        match room
            .merge_and_broadcast(peer, &msg.payload, Arc::new(frame))
            .await
        {
            Ok(reached) => {
                log::trace!("Relayed {:?} from {peer} to {reached} peers", msg.msg_type);
            }
            Err(e) => self.reject(peer, &e.to_string()).await,
        }
        Ok(())
    }

    async fn reject(&self, peer: Uuid, reason: &str) {
        self.stats.write().await.rejected_messages += 1;
        log::warn!("Dropping frame from {peer}: {reason}");
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get room manager reference.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn default_room_handler(
    State(server): State<SyncServer>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    server
        .upgrade_or_answer(ws, DEFAULT_ROOM.to_string(), addr)
        .await
}

async fn room_handler(
    State(server): State<SyncServer>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(room): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    server.upgrade_or_answer(ws, room_from_path(&room), addr).await
}

async fn health_handler(
    State(server): State<SyncServer>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    server.liveness(addr).await
}

async fn send_frame(ws_sender: &mut WsSink, frame: Vec<u8>) -> Result<(), SyncError> {
    ws_sender.send(Message::Binary(frame)).await?;
    Ok(())
}

/// Room name carried in the request path: `/board` → `board`.
pub fn room_from_path(path: &str) -> String {
    let name = path.trim_matches('/');
    if name.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:1234");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.evict_empty_rooms);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_peers_per_room: 5,
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config);
        assert_eq!(server.bind_addr(), "127.0.0.1:8080");
        assert_eq!(server.config().max_peers_per_room, 5);
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/board"), "board");
        assert_eq!(room_from_path("board"), "board");
        assert_eq!(room_from_path("/"), DEFAULT_ROOM);
        assert_eq!(room_from_path(""), DEFAULT_ROOM);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.rooms().room_count().await, 0);
    }
}
