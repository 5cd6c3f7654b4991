//! Session orchestration for the Dispatch runtime.
//!
//! Provides:
//! - `RunSessionManager` - session lifecycle and the event pump
//! - `ClaudeAuthManager` - device-code authorization over a session's own
//!   I/O channel
//! - In-memory `SessionRepository` implementation

pub mod auth;
pub mod manager;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{AuthError, AuthState, ClaudeAuthManager, InputDisposition};
pub use manager::{AdapterRegistry, CreateOptions, ManagerError, RunSessionManager};
pub use storage::MemoryRepository;
