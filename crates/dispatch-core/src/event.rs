//! Sequenced event records for the session log.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionId;

/// Namespaced channel an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventChannel {
    /// Process output chunk.
    #[serde(rename = "session:output")]
    SessionOutput,
    /// Client input chunk.
    #[serde(rename = "session:input")]
    SessionInput,
    /// Diagnostic for a failed or crashed session.
    #[serde(rename = "session:error")]
    SessionError,
    /// Lifecycle status transition.
    #[serde(rename = "session:status")]
    SessionStatus,
    /// Authorization state machine transition.
    #[serde(rename = "auth:status")]
    AuthStatus,
    /// Authorization URL for the device-code exchange.
    #[serde(rename = "auth:url")]
    AuthUrl,
    /// Authorization completed.
    #[serde(rename = "auth:success")]
    AuthSuccess,
    /// Authorization failed.
    #[serde(rename = "auth:error")]
    AuthError,
}

impl EventChannel {
    /// The wire representation of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionOutput => "session:output",
            Self::SessionInput => "session:input",
            Self::SessionError => "session:error",
            Self::SessionStatus => "session:status",
            Self::AuthStatus => "auth:status",
            Self::AuthUrl => "auth:url",
            Self::AuthSuccess => "auth:success",
            Self::AuthError => "auth:error",
        }
    }
}

/// One immutable entry in a session's log.
///
/// `seq` is assigned by the `EventStore` at append time and is the sole
/// ordering and deduplication key. Two events with identical payloads are
/// still distinct events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub seq: u64,
    pub channel: EventChannel,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl Event {
    /// Approximate in-memory size, used for history retention accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        let payload = match &self.payload {
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        };
        self.session_id.as_str().len() + self.event_type.len() + payload + 64
    }
}

/// Current time as unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
