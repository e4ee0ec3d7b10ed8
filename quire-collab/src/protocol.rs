//! Binary relay protocol for document rooms.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A room is one document; every page fragment of the document travels
//! through the same room. `peer_id` identifies a connection, not a user.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{AwarenessMessage, PeerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, opens the handshake
    SyncStep1 = 1,
    /// Yrs diff answering a state vector
    SyncStep2 = 2,
    /// Incremental room update
    Delta = 3,
    /// Presence update
    Awareness = 4,
    /// First message of a connection, carries the peer identity
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: Uuid,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id,
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, room_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room_id, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room_id, 0, diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        room_id: Uuid,
        clock: u64,
        msg: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = msg.encode().map_err(ProtocolError::Serialization)?;
        Ok(Self::new(MessageType::Awareness, peer_id, room_id, clock, payload))
    }

    pub fn peer_joined(
        peer_id: Uuid,
        room_id: Uuid,
        identity: &PeerIdentity,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(identity, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, peer_id, room_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, room_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload).map_err(ProtocolError::Deserialization)
    }

    pub fn peer_identity(&self) -> Result<PeerIdentity, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (identity, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(identity)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid message type")]
    InvalidMessageType,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Caret;

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let room = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, room, 42, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_peer_joined_carries_identity() {
        let identity = PeerIdentity::new(Uuid::new_v4(), "Alice");
        let msg = SyncMessage::peer_joined(Uuid::new_v4(), Uuid::new_v4(), &identity).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_identity().unwrap(), identity);
    }

    #[test]
    fn test_awareness_payload() {
        let focus = AwarenessMessage::Focus {
            user_id: Uuid::new_v4(),
            page_id: Some(Uuid::new_v4()),
            caret: Some(Caret { block: 0, offset: 3 }),
        };
        let msg = SyncMessage::awareness(Uuid::new_v4(), Uuid::new_v4(), 7, &focus).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_message().unwrap(), focus);
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(msg.awareness_message(), Err(ProtocolError::InvalidMessageType)));
        assert!(matches!(msg.peer_identity(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_delta_header_is_small() {
        let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), 1, vec![0u8; 50]);
        assert!(msg.encode().unwrap().len() < 150);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
