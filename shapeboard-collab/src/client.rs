//! WebSocket sync client bridging one [`ShapeStore`] to a relay room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - The bring-up handshake on every (re)connect
//! - Streaming of local updates out and remote updates in
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──► Synced
//!       ▲               │               │           │
//!       └───────────────┴─── error / close ─────────┘
//! ```
//!
//! Nothing is buffered across a disconnect: updates captured while offline
//! are dropped at session start because the handshake re-derives everything
//! the relay is missing from the store itself.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use shapeboard_core::{ShapeStore, Subscription};

use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage};
use crate::room::DEFAULT_ROOM;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FALLBACK_SERVER_URL: &str = "ws://localhost:1234";

/// Relay address baked in at build time, if any.
pub fn default_server_url() -> &'static str {
    option_env!("SHAPEBOARD_SERVER_URL").unwrap_or(FALLBACK_SERVER_URL)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base address, e.g. `ws://localhost:1234`
    pub server_url: String,
    /// Room to join; appended to the URL path
    pub room: String,
    /// Delay before the first reconnect attempt
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url().to_string(),
            room: DEFAULT_ROOM.to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2500),
            max_retries: None,
        }
    }
}

impl ClientConfig {
    /// Full connection target: server address plus room path.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake still running
    Connected,
    /// Handshake answered; streaming incremental updates
    Synced,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Synced)
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Relay's handshake answer merged
    Synced,
    /// Received and merged an update from another peer
    RemoteDelta { peer_id: Uuid, bytes: usize },
    /// Connection lost
    Disconnected,
    /// `max_retries` consecutive attempts failed; the loop has stopped
    GaveUp,
}

/// The sync client.
pub struct SyncClient {
    peer_id: Uuid,
    config: ClientConfig,
    store: ShapeStore,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    local_updates: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    task: Option<JoinHandle<()>>,
    _local_updates_sub: Subscription,
}

impl SyncClient {
    /// Create a client for `store`. Local changes to the store are captured
    /// from here on; nothing is sent until [`SyncClient::connect`].
    pub fn new(store: ShapeStore, config: ClientConfig) -> Result<Self, SyncError> {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let sub = store.observe_local_updates(move |update| {
            // Closed only once the client is gone.
            let _ = local_tx.send(update.to_vec());
        })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(256);
        Ok(Self {
            peer_id: Uuid::new_v4(),
            config,
            store,
            state_tx: Arc::new(state_tx),
            state_rx,
            event_tx,
            event_rx: Some(event_rx),
            local_updates: Arc::new(Mutex::new(local_rx)),
            task: None,
            _local_updates_sub: sub,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start the connection loop. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        let worker = Worker {
            peer_id: self.peer_id,
            config: self.config.clone(),
            store: self.store.clone(),
            state: self.state_tx.clone(),
            events: self.event_tx.clone(),
            local_updates: self.local_updates.clone(),
        };
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Stop the connection loop and drop the socket.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::info!("Sync client {} disconnected", self.peer_id);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Whether the connection loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// The boolean status signal for the UI.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.state_rx.clone();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == target).await;
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the connection task.
struct Worker {
    peer_id: Uuid,
    config: ClientConfig,
    store: ShapeStore,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::Sender<SyncEvent>,
    local_updates: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Worker {
    async fn run(self) {
        let url = self.config.url();
        let mut local_updates = self.local_updates.lock().await;
        let mut failures = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    failures = 0;
                    log::info!("Connected to {url} as {}", self.peer_id);
                    self.set_state(ConnectionState::Connected);
                    self.emit(SyncEvent::Connected);

                    match self.session(ws_stream, &mut local_updates).await {
                        Ok(()) => log::info!("Connection to {url} closed"),
                        Err(e) => log::warn!("Connection to {url} lost: {e}"),
                    }
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(SyncEvent::Disconnected);
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("Failed to connect to {url} (attempt {failures}): {e}");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if self.config.max_retries.is_some_and(|max| failures >= max) {
                log::error!("Giving up on {url} after {failures} failed attempts");
                self.emit(SyncEvent::GaveUp);
                return;
            }
            let delay = self.config.backoff(failures);
            log::debug!("Reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(
        &self,
        ws_stream: WsStream,
        local_updates: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let stale = std::iter::from_fn(|| local_updates.try_recv().ok()).count();
        if stale > 0 {
            log::debug!("Dropped {stale} offline updates; the handshake covers them");
        }

        let step1 = SyncMessage::sync_step1(self.peer_id, self.store.state_vector());
        ws_sender.send(Message::Binary(step1.encode()?.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(reply) = self.handle_frame(&data) {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                log::info!("Relay closed the connection: {}", frame.reason.as_str());
                            }
                            return Ok(());
                        }
                        None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                update = local_updates.recv() => {
                    let Some(update) = update else {
                        return Ok(());
                    };
                    let delta = SyncMessage::delta(self.peer_id, update);
                    ws_sender.send(Message::Binary(delta.encode()?.into())).await?;
                }
            }
        }
    }

    /// Merge one frame from the relay. Returns the encoded reply, if any.
    ///
    /// Bad frames are logged and skipped; they never end the session.
    fn handle_frame(&self, data: &[u8]) -> Option<Vec<u8>> {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring undecodable frame: {e}");
                return None;
            }
        };

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self
                    .store
                    .encode_diff(&msg.payload)
                    .map_err(|e| log::warn!("Cannot answer state vector: {e}"))
                    .ok()?;
                SyncMessage::sync_step2(self.peer_id, diff)
                    .encode()
                    .map_err(|e| log::warn!("Cannot encode handshake answer: {e}"))
                    .ok()
            }
            MessageType::SyncStep2 => {
                if let Err(e) = self.store.apply_update(&msg.payload) {
                    log::warn!("Rejected handshake answer: {e}");
                    return None;
                }
                if *self.state.borrow() != ConnectionState::Synced {
                    log::info!("Synced with relay ({} shapes)", self.store.len());
                    self.set_state(ConnectionState::Synced);
                    self.emit(SyncEvent::Synced);
                }
                None
            }
            MessageType::Delta => {
                match self.store.apply_update(&msg.payload) {
                    Ok(()) => self.emit(SyncEvent::RemoteDelta {
                        peer_id: msg.peer_id,
                        bytes: msg.payload.len(),
                    }),
                    Err(e) => log::warn!("Rejected update from {}: {e}", msg.peer_id),
                }
                None
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::trace!("Sync event dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapeboard_core::{Shape, ShapeKind};
    use tokio::net::TcpListener;

    fn config(url: &str) -> ClientConfig {
        ClientConfig {
            server_url: url.to_string(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.room, "shapeboard");
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_millis(2500));
        assert_eq!(config.max_retries, None);
        assert!(config.server_url.starts_with("ws"));
    }

    #[test]
    fn test_url_appends_room() {
        let mut config = config("ws://localhost:9090/");
        assert_eq!(config.url(), "ws://localhost:9090/shapeboard");
        config.room = "design".to_string();
        assert_eq!(config.url(), "ws://localhost:9090/design");
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(1600));
        assert_eq!(config.backoff(5), Duration::from_millis(2500));
        assert_eq!(config.backoff(40), Duration::from_millis(2500));
    }

    #[test]
    fn test_connection_state_signal() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Synced.is_connected());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(ShapeStore::new(), config("ws://localhost:9090")).unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(ShapeStore::new(), config("ws://localhost:9090")).unwrap();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        // Reserve a port, then free it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = ShapeStore::new();
        store
            .push(&[Shape::new("offline", ShapeKind::Square, 0.0, 0.0)])
            .unwrap();

        let mut client = SyncClient::new(
            store,
            ClientConfig {
                server_url: format!("ws://{addr}"),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                max_retries: Some(3),
                ..ClientConfig::default()
            },
        )
        .unwrap();
        let mut events = client.take_event_rx().unwrap();
        client.connect();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SyncEvent::GaveUp));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_stops_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = SyncClient::new(ShapeStore::new(), config(&format!("ws://{addr}"))).unwrap();
        client.connect();
        assert!(client.is_running());
        client.disconnect();
        assert!(!client.is_running());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
