//! Wire protocol for client-server communication.
//!
//! JSON messages tagged by `type`; terminal data crosses the wire base64
//! encoded. Requests that expect a reply carry a client-chosen `id` the
//! reply echoes back.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dispatch_core::event::Event;
use dispatch_core::session::{SessionKind, SessionRecord, SessionStatus};
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the socket. Must precede everything else.
    Auth { id: u64, key: String },
    /// Create a session.
    SessionCreate {
        id: u64,
        kind: SessionKind,
        workspace_path: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        command: Option<String>,
    },
    /// Attach to a session: replay from `from_seq`, then live events.
    /// Omitting `from_seq` attaches live-only.
    SessionAttach {
        id: u64,
        session_id: String,
        #[serde(default)]
        from_seq: Option<u64>,
    },
    /// Input data (base64 encoded).
    SessionInput { session_id: String, data: String },
    /// Resize terminal geometry.
    SessionResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Drop this socket's attachment; the session keeps running.
    SessionDetach { session_id: String },
    /// Stop the session's process.
    SessionClose { id: u64, session_id: String },
    /// Lightweight status poll.
    SessionStatus { id: u64, session_id: String },
    /// List session records.
    SessionList { id: u64 },
    /// Start the device-code authorization exchange on an agent session.
    AgentLogin { id: u64, session_id: String },
    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Create an input message from raw bytes.
    #[must_use]
    pub fn input(session_id: impl Into<String>, data: &[u8]) -> Self {
        Self::SessionInput {
            session_id: session_id.into(),
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64.
    #[must_use]
    pub fn decode_input(&self) -> Option<Vec<u8>> {
        if let Self::SessionInput { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Generic success reply.
    Ok { id: u64 },
    /// Session created.
    SessionCreated { id: u64, session_id: String },
    /// Status poll reply.
    Status {
        id: u64,
        session_id: String,
        status: SessionStatus,
        last_seq: u64,
    },
    /// Session list reply.
    Sessions {
        id: u64,
        sessions: Vec<SessionRecord>,
    },
    /// One replayed or live event.
    Event { event: Event },
    /// Replay is done; everything after this is live.
    CaughtUp { session_id: String, seq: u64 },
    /// Rejection. `id` echoes the request when one was carried.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        error: ErrorKind,
        message: String,
    },
    /// Keepalive reply.
    Pong,
}

/// Rejection taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The socket has not completed `auth`.
    NotAuthenticated,
    /// The supplied key was rejected.
    Unauthorized,
    /// Input or resize on a session that is not `running`.
    NotRunning,
    /// Unknown session id.
    NotFound,
    /// The adapter could not spawn the process.
    StartFailed,
    /// Replay requested from a pruned range.
    HistoryUnavailable,
    /// The requested path escapes the workspace.
    InvalidWorkspacePath,
    /// Malformed or unexpected frame.
    BadRequest,
    /// Unexpected server-side failure.
    Internal,
}
