//! Binary protocol for CRDT synchronization.
//!
//! Wire format (bincode-encoded, one frame per binary WebSocket message):
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │ msg_type │ peer_id   │ payload                      │
//! │ varint   │ 16 bytes  │ length-prefixed Yrs bytes    │
//! └──────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! Handshake (both sides run it symmetrically):
//! ```text
//!   peer                                relay
//!    │ ── SyncStep1(peer state vector) ──► │
//!    │ ◄── SyncStep1(relay state vector) ─ │
//!    │ ◄── SyncStep2(relay diff) ───────── │   peer is now synced
//!    │ ── SyncStep2(peer diff) ──────────► │   relay merges + fans out
//!    │ ◄═══════ Delta ... Delta ═════════► │
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector: "this is what I have"
    SyncStep1 = 0,
    /// Yrs diff answering a state vector
    SyncStep2 = 1,
    /// Incremental update
    Delta = 2,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Replica that produced the message. `Uuid::nil()` for the relay.
    pub peer_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            payload: state_vector,
        }
    }

    pub fn sync_step2(peer_id: Uuid, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            payload: diff,
        }
    }

    pub fn delta(peer_id: Uuid, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            payload: update,
        }
    }

    /// Whether the payload is a Yrs update (as opposed to a state vector).
    pub fn carries_update(&self) -> bool {
        matches!(self.msg_type, MessageType::SyncStep2 | MessageType::Delta)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.carries_update());
    }

    #[test]
    fn test_step1_is_not_an_update() {
        let msg = SyncMessage::sync_step1(Uuid::nil(), vec![0]);
        assert!(!msg.carries_update());
        assert!(SyncMessage::sync_step2(Uuid::nil(), vec![0]).carries_update());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut bytes = SyncMessage::delta(Uuid::new_v4(), vec![7]).encode().unwrap();
        bytes.push(0);
        assert_eq!(
            SyncMessage::decode(&bytes),
            Err(ProtocolError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 0);
        assert_eq!(MessageType::SyncStep2 as u8, 1);
        assert_eq!(MessageType::Delta as u8, 2);
    }

    #[test]
    fn test_frame_overhead_is_small() {
        let msg = SyncMessage::delta(Uuid::new_v4(), vec![0u8; 32]);
        let encoded = msg.encode().unwrap();
        // 1 type + 16 peer + 1 length prefix + payload
        assert!(
            encoded.len() < 32 + 24,
            "Encoded size {} too large for 32-byte delta",
            encoded.len()
        );
    }
}
