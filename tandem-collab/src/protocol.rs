//! Binary protocol for document synchronization.
//!
//! Wire format (bincode `standard`, one message per WebSocket binary frame):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────────┐
//! │ variant │ payload                                          │
//! │ varint  │                                                  │
//! ├─────────┼──────────────────────────────────────────────────┤
//! │ 0       │ StateRequest  { state_vector }                   │
//! │ 1       │ StateResponse { operations, state_vector }       │
//! │ 2       │ Update        { operations }                     │
//! │ 3       │ Presence      { entries: [client, clock, json?] }│
//! └─────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! Handshake: each side sends a StateRequest with its state vector; the
//! other answers with a StateResponse carrying exactly the operations the
//! requester is missing. After that only Update and Presence frames flow.
//!
//! Reference: Kleppmann, DDIA, Chapter 5 (Replication Logs)

use serde::{Deserialize, Serialize};
use tandem_core::{Operation, StateVector};
use thiserror::Error;

use crate::awareness::AwarenessUpdate;

/// Prefix of room keys derived from a file id.
pub const FILE_ROOM_PREFIX: &str = "file-";

/// Message kind, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    StateRequest = 1,
    StateResponse = 2,
    Update = 3,
    Presence = 4,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "Here is what I have; send me what I'm missing."
    StateRequest { state_vector: StateVector },
    /// Operations the requester is missing plus the sender's state vector.
    StateResponse {
        operations: Vec<Operation>,
        state_vector: StateVector,
    },
    /// Incremental operations, relayed room-wide.
    Update { operations: Vec<Operation> },
    /// Added/updated/removed awareness entries.
    Presence(AwarenessUpdate),
}

impl SyncMessage {
    /// A request for everything: empty state vector.
    pub fn request_all() -> Self {
        SyncMessage::StateRequest {
            state_vector: StateVector::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::StateRequest { .. } => MessageType::StateRequest,
            SyncMessage::StateResponse { .. } => MessageType::StateResponse,
            SyncMessage::Update { .. } => MessageType::Update,
            SyncMessage::Presence(_) => MessageType::Presence,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("invalid presence state: {0}")]
    InvalidPresence(String),
    #[error("request path does not name a room")]
    MissingRoom,
}

/// Room key for a file: `"file-" + file_id`.
pub fn room_key_for_file(file_id: &str) -> String {
    format!("{FILE_ROOM_PREFIX}{file_id}")
}

/// Inverse of [`room_key_for_file`].
pub fn file_id_from_room_key(room_key: &str) -> Option<&str> {
    room_key
        .strip_prefix(FILE_ROOM_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Room key from a WebSocket request path such as `/file-42?token=…`.
pub fn room_key_from_path(path: &str) -> Result<String, ProtocolError> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let key = path.trim_matches('/');
    if key.is_empty() {
        return Err(ProtocolError::MissingRoom);
    }
    Ok(key.to_string())
}
