//! JSON wire protocol.
//!
//! One logical bidirectional channel per client; each frame is a JSON
//! object `{event, data}`:
//!
//! ```text
//! {"event":"code-change","data":{"file_id":"…","op":{"type":"insert",…}}}
//! {"event":"error","data":{"code":"forbidden","message":"…"}}
//! ```
//!
//! Inbound and outbound frames are tagged unions; decoding failures are
//! protocol violations and close the session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatEntry;
use crate::error::{ErrorKind, ServiceError};
use crate::ot::Operation;
use crate::presence::PresenceRecord;
use crate::store::File;

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    JoinRoom {
        room_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    LeaveRoom,
    CodeChange {
        file_id: Uuid,
        op: Operation,
    },
    CursorPosition {
        file_id: Uuid,
        line: u32,
        column: u32,
    },
    ChatMessage {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code_snippet: Option<String>,
    },
    GetChatHistory,
    CreateFile {
        name: String,
        language: String,
    },
    DeleteFile {
        file_id: Uuid,
    },
}

/// Frames the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    RoomUsers {
        users: Vec<PresenceRecord>,
    },
    RoomFiles {
        files: Vec<File>,
    },
    UserJoined {
        user: PresenceRecord,
    },
    UserLeft {
        user_id: Uuid,
    },
    CodeUpdate {
        file_id: Uuid,
        op: Operation,
        user_id: Uuid,
    },
    CursorUpdate {
        user_id: Uuid,
        file_id: Uuid,
        line: u32,
        column: u32,
    },
    ChatMessage(ChatEntry),
    ChatHistory {
        messages: Vec<ChatEntry>,
    },
    FileCreated {
        file: File,
    },
    FileDeleted {
        file_id: Uuid,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: kind.code().to_string(),
            message: message.into(),
        }
    }

    pub fn from_service_error(err: &ServiceError) -> Self {
        ServerFrame::error(err.kind, err.message.clone())
    }

    /// Frame classes the hub may shed under backpressure: cursor updates
    /// first, then chat-history replays. Everything else disconnects the
    /// peer rather than block the room.
    pub fn droppable(&self) -> bool {
        matches!(
            self,
            ServerFrame::CursorUpdate { .. } | ServerFrame::ChatHistory { .. }
        )
    }
}

/// Decoding failures. Malformed frames close the session.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn decode_server(text: &str) -> Result<ServerFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn encode_client(frame: &ClientFrame) -> String {
    // Frames are build-time shapes; serialization cannot fail on them.
    serde_json::to_string(frame).unwrap_or_default()
}

pub fn encode_server(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}
