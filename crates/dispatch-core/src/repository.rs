//! Durable session records, independent of event content.

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{SessionId, SessionKind, SessionRecord, SessionStatus};

/// Repository error.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("repository error: {0}")]
    Internal(String),
}

/// Filter for session queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub kind: Option<SessionKind>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}

/// Trait for session record backends.
///
/// Safe for concurrent reads; writes are serialized per session id by the
/// implementation.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a freshly created record.
    async fn insert(&self, record: SessionRecord) -> Result<(), RepositoryError>;

    /// Fetch a record by id.
    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError>;

    /// Transition the session's lifecycle status.
    async fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError>;

    /// Transition to `Error`, recording why for later queries.
    async fn mark_error(&self, id: &SessionId, message: &str) -> Result<(), RepositoryError>;

    /// Bump `last_activity_at` to now.
    async fn touch(&self, id: &SessionId) -> Result<(), RepositoryError>;

    /// List records matching the filter, newest first.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, RepositoryError>;
}
