//! # shapeboard-collab — Sync transport and relay for shapeboard
//!
//! Keeps [`shapeboard_core::ShapeStore`] replicas in step over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  ws://host/<room>   │ (relay)     │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ ShapeStore  │                     │ Room        │
//! │ (local)     │                     │ replica     │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Per-room fan-out that never echoes to the sender
//! - [`room`] — Room replicas and the room registry
//! - [`server`] — WebSocket relay server (axum), with a liveness response on the same port
//! - [`client`] — WebSocket sync client with reconnect

pub mod protocol;
pub mod broadcast;
pub mod room;
pub mod server;
pub mod client;
pub mod error;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use room::{Room, RoomManager, DEFAULT_ROOM};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use error::SyncError;
