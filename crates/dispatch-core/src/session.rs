//! Session identity and lifecycle types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier, prefixed by kind (e.g. `pty-1f0c…`).
///
/// The prefix is cosmetic; nothing parses it back out. Equality on the full
/// string is the only contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh id for the given kind.
    #[must_use]
    pub fn generate(kind: SessionKind) -> Self {
        Self(format!("{}-{}", kind.id_prefix(), Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The kind of process a session multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// Interactive shell on a PTY.
    Terminal,
    /// AI coding agent CLI.
    AiAgent,
    /// Secondary agent runtime (piped stdio).
    SecondaryAgent,
    /// Collaborative file editor; owns no process.
    FileEditor,
}

impl SessionKind {
    /// Id prefix for sessions of this kind.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Terminal => "pty",
            Self::AiAgent => "agent",
            Self::SecondaryAgent => "runner",
            Self::FileEditor => "edit",
        }
    }

    /// Whether sessions of this kind have terminal geometry.
    #[must_use]
    pub const fn has_geometry(self) -> bool {
        matches!(self, Self::Terminal | Self::AiAgent)
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Adapter is spinning up the process.
    Starting,
    /// Process is live; exactly one adapter handle is bound.
    Running,
    /// Closed gracefully. Final.
    Stopped,
    /// Adapter failed to start or the process crashed. Final.
    Error,
}

impl SessionStatus {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Durable record of a session, independent of its event content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub kind: SessionKind,
    pub workspace_path: PathBuf,
    pub status: SessionStatus,
    /// Why the session entered `Error`, for clients that were not
    /// attached at the time of failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub last_activity_at: i64,
}

impl SessionRecord {
    /// Create a record in `Starting` for a freshly minted session.
    #[must_use]
    pub fn new(kind: SessionKind, workspace_path: PathBuf) -> Self {
        let now = crate::event::now_millis();
        Self {
            id: SessionId::generate(kind),
            kind,
            workspace_path,
            status: SessionStatus::Starting,
            error_message: None,
            created_at: now,
            last_activity_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_kind_prefix() {
        let id = SessionId::generate(SessionKind::Terminal);
        assert!(id.as_str().starts_with("pty-"));

        let id = SessionId::generate(SessionKind::SecondaryAgent);
        assert!(id.as_str().starts_with("runner-"));
    }

    #[test]
    fn ids_are_unique() {
        let a = SessionId::generate(SessionKind::AiAgent);
        let b = SessionId::generate(SessionKind::AiAgent);
        assert_ne!(a, b);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&SessionKind::AiAgent).unwrap(),
            "\"ai-agent\""
        );
        assert_eq!(
            serde_json::to_string(&SessionKind::FileEditor).unwrap(),
            "\"file-editor\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
    }
}
