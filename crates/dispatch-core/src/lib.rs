//! Core abstractions for the Dispatch session runtime.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` / `EventStore` - Sequenced, replayable per-session log
//! - `Adapter` - Uniform contract over heterogeneous child processes
//! - `SessionRepository` - Durable session records
//! - Collaborator traits for settings, auth keys, and workspace paths

pub mod adapter;
pub mod collaborators;
pub mod event;
pub mod repository;
pub mod session;
pub mod store;

pub use adapter::{Adapter, AdapterError, AdapterEvent, AdapterHandle, StartConfig};
pub use event::{Event, EventChannel};
pub use repository::{RepositoryError, SessionFilter, SessionRepository};
pub use session::{SessionId, SessionKind, SessionRecord, SessionStatus};
pub use store::{EventStore, StoreError};
