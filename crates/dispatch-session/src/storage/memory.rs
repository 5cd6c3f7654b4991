//! In-memory session repository.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use dispatch_core::event::now_millis;
use dispatch_core::repository::{RepositoryError, SessionFilter, SessionRepository};
use dispatch_core::session::{SessionId, SessionRecord, SessionStatus};

/// In-memory repository.
///
/// Useful for development and single-process deployments. Records are
/// lost on restart.
#[derive(Default)]
pub struct MemoryRepository {
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_record<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, RepositoryError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| RepositoryError::Internal(e.to_string()))?;
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        Ok(f(record))
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn insert(&self, record: SessionRecord) -> Result<(), RepositoryError> {
        self.sessions
            .write()
            .map_err(|e| RepositoryError::Internal(e.to_string()))?
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| RepositoryError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        self.with_record(id, |record| {
            record.status = status;
            record.last_activity_at = now_millis();
        })
    }

    async fn mark_error(&self, id: &SessionId, message: &str) -> Result<(), RepositoryError> {
        self.with_record(id, |record| {
            record.status = SessionStatus::Error;
            record.error_message = Some(message.to_owned());
            record.last_activity_at = now_millis();
        })
    }

    async fn touch(&self, id: &SessionId) -> Result<(), RepositoryError> {
        self.with_record(id, |record| {
            record.last_activity_at = now_millis();
        })
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, RepositoryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| RepositoryError::Internal(e.to_string()))?;

        let mut result: Vec<SessionRecord> = sessions
            .values()
            .filter(|record| {
                if let Some(kind) = filter.kind {
                    if record.kind != kind {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if record.status != status {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }
}
