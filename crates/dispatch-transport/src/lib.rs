//! Wire protocol and WebSocket router for the Dispatch runtime.
//!
//! Provides:
//! - `ClientMessage` / `ServerMessage` - JSON + base64 wire protocol
//! - `Connection` - transport-free per-socket state machine
//! - Axum WebSocket and REST surfaces over the same event store

pub mod http;
pub mod protocol;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testsupport;

pub use protocol::{ClientMessage, ErrorKind, ServerMessage};
pub use websocket::{Connection, RouterState, create_router};
