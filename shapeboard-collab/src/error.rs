//! Transport-level errors shared by the relay and the client.

use shapeboard_core::StoreError;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Relay socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Room '{room}' is full ({limit} peers)")]
    RoomFull { room: String, limit: usize },
}
