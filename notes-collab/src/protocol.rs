//! Live-channel protocol between note sessions and the server.
//!
//! One serde model, two codecs: binary WebSocket frames carry bincode
//! (standard config), text frames carry JSON. The server answers in the
//! codec the client last used.
//!
//! ```text
//! client                                   server
//!   │ ── join{note_id, token} ──────────────► │
//!   │ ◄──────────── presence_list{session, document, entries}
//!   │ ◄──────────── presence_update{presence}          (to everyone)
//!   │ ── edit{payload} ─────────────────────► │
//!   │ ◄──────────── edit_applied{entry, content, version} (to everyone)
//!   │ ── presence{cursor…} ─────────────────► │
//!   │ ◄──────────── presence_update{presence}          (to everyone)
//!   │ ── undo | redo | history | sync | ping ► │
//!   │ ◄──────────── document | history | sync_result | pong (requester only)
//! ```

use notes_core::{EditLogEntry, EntryKind, OpPayload, SyncRequest, SyncResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{PresenceCursor, PresenceEntry};

/// Messages sent by a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on every connection.
    Join { note_id: Uuid, token: String },
    Edit { payload: OpPayload },
    Presence {
        cursor_pos: usize,
        selection_start: usize,
        selection_end: usize,
    },
    Undo,
    Redo,
    Sync { request: SyncRequest },
    History,
    Ping,
    Leave,
}

impl ClientMessage {
    pub fn presence(cursor: PresenceCursor) -> Self {
        Self::Presence {
            cursor_pos: cursor.cursor_pos,
            selection_start: cursor.selection_start,
            selection_end: cursor.selection_end,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Content and version of a note at one point in its history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    pub content: String,
    pub version: u64,
}

/// Flattened log entry for history listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub sequence: u64,
    pub op_type: String,
    pub position: usize,
    pub length: usize,
    pub text: String,
    pub author: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub kind: EntryKind,
}

impl From<&EditLogEntry> for HistoryEvent {
    fn from(entry: &EditLogEntry) -> Self {
        Self {
            sequence: entry.sequence,
            op_type: entry.op.op_type().as_str().to_string(),
            position: entry.op.position(),
            length: entry.op.length(),
            text: entry.op.text().to_string(),
            author: entry.author_id,
            timestamp: entry.applied_at,
            kind: entry.kind,
        }
    }
}

/// Error categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRange,
    Unauthorized,
    NotMember,
    NoteNotFound,
    SessionLimit,
    InvalidMessage,
    Internal,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message to a joiner: its own session id, the current document
    /// and everyone already present.
    PresenceList {
        session_id: Uuid,
        document: DocumentState,
        entries: Vec<PresenceEntry>,
    },
    PresenceUpdate { presence: PresenceEntry },
    PresenceLeft { user_id: Uuid, session_id: Uuid },
    EditApplied {
        entry: EditLogEntry,
        content: String,
        version: u64,
    },
    Document { document: DocumentState },
    SyncResult { result: SyncResult },
    History { events: Vec<HistoryEvent> },
    Error { kind: ErrorKind, message: String },
    Ping,
    Pong,
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Wire name of the message, matching the JSON tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PresenceList { .. } => "presence_list",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::PresenceLeft { .. } => "presence_left",
            Self::EditApplied { .. } => "edit_applied",
            Self::Document { .. } => "document",
            Self::SyncResult { .. } => "sync_result",
            Self::History { .. } => "history",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Join rejected ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },
    #[error("Offline queue full ({0} operations)")]
    QueueFull(usize),
}
