//! Session lifecycle manager.
//!
//! One pump task per session owns the adapter's event stream and is the
//! only writer of that session's output events; client input is appended
//! to the log before it reaches the adapter, so a crash mid-write never
//! loses the record of what was asked.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dispatch_core::adapter::{Adapter, AdapterError, AdapterEvent, AdapterHandle, StartConfig};
use dispatch_core::collaborators::{OutsideWorkspace, SettingsAccessor, WorkspacePathResolver};
use dispatch_core::event::{Event, EventChannel};
use dispatch_core::repository::{RepositoryError, SessionFilter, SessionRepository};
use dispatch_core::session::{SessionId, SessionKind, SessionRecord, SessionStatus};
use dispatch_core::store::EventStore;
use serde_json::json;
use tokio::sync::RwLock;

/// Settings category holding environment variables injected into new
/// sessions.
const ENVIRONMENT_CATEGORY: &str = "environment";

/// Manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session is not running: {0}")]
    NotRunning(SessionId),
    #[error("failed to start session: {0}")]
    StartFailed(String),
    #[error(transparent)]
    InvalidWorkspacePath(#[from] OutsideWorkspace),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<AdapterError> for ManagerError {
    fn from(err: AdapterError) -> Self {
        Self::StartFailed(err.to_string())
    }
}

/// Maps each session kind to its adapter.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SessionKind, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind. Last registration wins.
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    fn get(&self, kind: SessionKind) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&kind).cloned()
    }
}

/// Options for `RunSessionManager::create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Override for the adapter's default command line.
    pub command: Option<String>,
}

struct ActiveSession {
    handle: AdapterHandle,
    closing: Arc<AtomicBool>,
}

/// Session lifecycle manager.
pub struct RunSessionManager<R: SessionRepository> {
    repository: Arc<R>,
    store: Arc<EventStore>,
    adapters: AdapterRegistry,
    settings: Arc<dyn SettingsAccessor>,
    resolver: Arc<dyn WorkspacePathResolver>,
    // Shared with each session's pump task, which removes its own entry
    // when the process goes away.
    active: Arc<RwLock<HashMap<SessionId, ActiveSession>>>,
}

impl<R: SessionRepository + 'static> RunSessionManager<R> {
    #[must_use]
    pub fn new(
        repository: Arc<R>,
        store: Arc<EventStore>,
        adapters: AdapterRegistry,
        settings: Arc<dyn SettingsAccessor>,
        resolver: Arc<dyn WorkspacePathResolver>,
    ) -> Self {
        Self {
            repository,
            store,
            adapters,
            settings,
            resolver,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The shared event store.
    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Create a session: resolve the path, persist the record, start the
    /// adapter, and begin pumping its output into the log.
    ///
    /// On start failure the session transitions to `error` and stays
    /// queryable; the record carries the reason.
    ///
    /// # Errors
    /// `InvalidWorkspacePath`, `StartFailed`, or a repository error.
    pub async fn create(
        &self,
        kind: SessionKind,
        requested_path: &str,
        opts: CreateOptions,
    ) -> Result<SessionRecord, ManagerError> {
        let workspace_path = self.resolver.resolve(requested_path)?;

        let mut record = SessionRecord::new(kind, workspace_path.clone());
        let session_id = record.id.clone();
        self.repository.insert(record.clone()).await?;

        let Some(adapter) = self.adapters.get(kind) else {
            let message = format!("no adapter registered for kind {kind:?}");
            self.repository.mark_error(&session_id, &message).await?;
            return Err(ManagerError::StartFailed(message));
        };

        let mut config = StartConfig::new(workspace_path).with_env(self.session_env().await);
        if let (Some(cols), Some(rows)) = (opts.cols, opts.rows) {
            config = config.with_size(cols, rows);
        }
        if let Some(command) = opts.command {
            config = config.with_command(command);
        }

        let mut handle = match adapter.start(config).await {
            Ok(handle) => handle,
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(session_id = %session_id, %message, "session start failed");
                self.repository.mark_error(&session_id, &message).await?;
                return Err(err.into());
            }
        };

        let events = handle
            .take_events()
            .ok_or_else(|| ManagerError::StartFailed("adapter yielded no event stream".into()))?;

        self.repository
            .update_status(&session_id, SessionStatus::Running)
            .await?;
        record.status = SessionStatus::Running;

        self.store.append(
            &session_id,
            EventChannel::SessionStatus,
            "status",
            json!({ "status": SessionStatus::Running }),
        );

        let closing = Arc::new(AtomicBool::new(false));
        self.active.write().await.insert(
            session_id.clone(),
            ActiveSession {
                handle,
                closing: Arc::clone(&closing),
            },
        );

        self.spawn_pump(session_id.clone(), events, closing);

        tracing::info!(session_id = %session_id, kind = ?kind, "session running");
        Ok(record)
    }

    /// Append the input to the log, then forward it to the adapter.
    ///
    /// # Errors
    /// `NotRunning` when the session is not in `running`, `NotFound` when
    /// it never existed.
    pub async fn submit_input(
        &self,
        session_id: &SessionId,
        data: Vec<u8>,
    ) -> Result<Event, ManagerError> {
        let active = self.active.read().await;
        let Some(session) = active.get(session_id) else {
            drop(active);
            return Err(self.missing(session_id).await);
        };

        // Durably logged before it touches the process.
        let event = self.store.append(
            session_id,
            EventChannel::SessionInput,
            "chunk",
            json!({ "data": BASE64.encode(&data) }),
        );
        session.handle.write(data);
        drop(active);

        self.repository.touch(session_id).await?;
        Ok(event)
    }

    /// Forward new geometry to the adapter. Not logged; terminal size is
    /// not part of conversation history.
    ///
    /// # Errors
    /// `NotRunning` or `NotFound`.
    pub async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), ManagerError> {
        let active = self.active.read().await;
        let Some(session) = active.get(session_id) else {
            drop(active);
            return Err(self.missing(session_id).await);
        };
        session.handle.resize(cols, rows);
        Ok(())
    }

    /// Stop the adapter and finalize the session as `stopped`.
    ///
    /// Idempotent: closing an already-terminal session is a no-op.
    ///
    /// # Errors
    /// `NotFound` for unknown ids.
    pub async fn close(&self, session_id: &SessionId) -> Result<(), ManagerError> {
        let removed = self.active.write().await.remove(session_id);
        let Some(session) = removed else {
            let record = self
                .repository
                .get(session_id)
                .await?
                .ok_or_else(|| ManagerError::NotFound(session_id.clone()))?;
            if record.status.is_terminal() {
                return Ok(());
            }
            // Starting sessions without an active handle resolve on their
            // own; there is nothing to stop yet.
            return Err(ManagerError::NotRunning(session_id.clone()));
        };

        session.closing.store(true, Ordering::SeqCst);
        session.handle.stop();

        self.repository
            .update_status(session_id, SessionStatus::Stopped)
            .await?;
        self.store.append(
            session_id,
            EventChannel::SessionStatus,
            "status",
            json!({ "status": SessionStatus::Stopped, "reason": "closed" }),
        );
        tracing::info!(session_id = %session_id, "session closed");
        Ok(())
    }

    /// Lifecycle status plus the session's latest committed seq.
    ///
    /// # Errors
    /// `NotFound` for unknown ids.
    pub async fn status(
        &self,
        session_id: &SessionId,
    ) -> Result<(SessionStatus, u64), ManagerError> {
        let record = self
            .repository
            .get(session_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(session_id.clone()))?;
        Ok((record.status, self.store.latest_seq(session_id)))
    }

    /// Fetch one session record.
    ///
    /// # Errors
    /// `NotFound` for unknown ids.
    pub async fn get(&self, session_id: &SessionId) -> Result<SessionRecord, ManagerError> {
        self.repository
            .get(session_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(session_id.clone()))
    }

    /// List session records, newest first.
    ///
    /// # Errors
    /// Repository errors only.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, ManagerError> {
        Ok(self.repository.list(SessionFilter::default()).await?)
    }

    async fn missing(&self, session_id: &SessionId) -> ManagerError {
        match self.repository.get(session_id).await {
            Ok(Some(_)) => ManagerError::NotRunning(session_id.clone()),
            Ok(None) => ManagerError::NotFound(session_id.clone()),
            Err(err) => err.into(),
        }
    }

    async fn session_env(&self) -> HashMap<String, String> {
        let Some(value) = self.settings.get(ENVIRONMENT_CATEGORY).await else {
            return HashMap::new();
        };
        let Some(map) = value.as_object() else {
            return HashMap::new();
        };
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect()
    }

    /// The per-session worker: sole consumer of the adapter's event
    /// stream, sole writer of this session's output events.
    fn spawn_pump(
        &self,
        session_id: SessionId,
        mut events: tokio::sync::mpsc::UnboundedReceiver<AdapterEvent>,
        closing: Arc<AtomicBool>,
    ) {
        let store = Arc::clone(&self.store);
        let repository = Arc::clone(&self.repository);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AdapterEvent::Output(chunk) => {
                        store.append(
                            &session_id,
                            EventChannel::SessionOutput,
                            "chunk",
                            json!({ "data": BASE64.encode(&chunk) }),
                        );
                    }
                    AdapterEvent::Exited { code } => {
                        let graceful = closing.load(Ordering::SeqCst) || code == Some(0);
                        if graceful {
                            finalize_stopped(&*repository, &store, &session_id, code, &closing)
                                .await;
                        } else {
                            let message = match code {
                                Some(code) => {
                                    format!("process exited unexpectedly with code {code}")
                                }
                                None => "process terminated by signal".to_owned(),
                            };
                            finalize_error(&*repository, &store, &session_id, &message, code)
                                .await;
                        }
                        break;
                    }
                    AdapterEvent::Fatal { message } => {
                        finalize_error(&*repository, &store, &session_id, &message, None).await;
                        break;
                    }
                }
            }
            active.write().await.remove(&session_id);
            tracing::debug!(session_id = %session_id, "pump finished");
        });
    }
}

async fn finalize_stopped<R: SessionRepository>(
    repository: &R,
    store: &EventStore,
    session_id: &SessionId,
    code: Option<i32>,
    closing: &AtomicBool,
) {
    // `close` already transitioned and emitted the terminal event.
    if closing.load(Ordering::SeqCst) {
        return;
    }
    if let Err(err) = repository
        .update_status(session_id, SessionStatus::Stopped)
        .await
    {
        tracing::error!(session_id = %session_id, ?err, "failed to persist stopped status");
    }
    store.append(
        session_id,
        EventChannel::SessionStatus,
        "status",
        json!({ "status": SessionStatus::Stopped, "exit_code": code }),
    );
}

async fn finalize_error<R: SessionRepository>(
    repository: &R,
    store: &EventStore,
    session_id: &SessionId,
    message: &str,
    code: Option<i32>,
) {
    tracing::warn!(session_id = %session_id, message, "session crashed");
    if let Err(err) = repository.mark_error(session_id, message).await {
        tracing::error!(session_id = %session_id, ?err, "failed to persist error status");
    }
    store.append(
        session_id,
        EventChannel::SessionError,
        "adapter_crashed",
        json!({ "message": message, "exit_code": code }),
    );
    store.append(
        session_id,
        EventChannel::SessionStatus,
        "status",
        json!({ "status": SessionStatus::Error }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeAdapter, manager_with};
    use futures::StreamExt;
    use std::time::Duration;

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn create_transitions_to_running_with_status_event() {
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, store) = manager_with(AdapterRegistry::new().with(adapter));

        let record = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap();

        assert_eq!(record.status, SessionStatus::Running);
        assert!(record.id.as_str().starts_with("pty-"));

        let events = store.replay(&record.id, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, EventChannel::SessionStatus);
        assert_eq!(events[0].payload["status"], "running");
    }

    #[tokio::test]
    async fn input_then_output_replays_in_order() {
        // Concrete scenario: input "pwd\n" gets seq after the status
        // event, the output lands right behind it, and a late attacher
        // replaying from 0 sees both in order, then goes live.
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));

        let id = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;
        let base = store.latest_seq(&id);

        let input = manager
            .submit_input(&id, b"pwd\n".to_vec())
            .await
            .unwrap();
        assert_eq!(input.seq, base + 1);
        assert_eq!(input.channel, EventChannel::SessionInput);

        adapter.emit_output(b"/workspace\n");
        wait_until(|| store.latest_seq(&id) >= base + 2).await;

        let mut stream = store.subscribe_from(&id, base).unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(
            (first.seq, first.channel),
            (base + 1, EventChannel::SessionInput)
        );
        assert_eq!(
            (second.seq, second.channel),
            (base + 2, EventChannel::SessionOutput)
        );

        // Live continuation after the replayed tail.
        adapter.emit_output(b"$ ");
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.seq, base + 3);
    }

    #[tokio::test]
    async fn repeated_identical_input_is_preserved_twice() {
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, _store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));

        let id = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        let first = manager.submit_input(&id, b"ls\n".to_vec()).await.unwrap();
        let second = manager.submit_input(&id, b"ls\n".to_vec()).await.unwrap();
        assert_eq!(second.seq, first.seq + 1);
        wait_until(|| adapter.written().len() == 2).await;
        assert_eq!(adapter.written().len(), 2);
    }

    #[tokio::test]
    async fn start_failure_leaves_queryable_error_session() {
        // Concrete scenario: StartFailed leaves status=error, lastSeq=0,
        // and input is rejected as NotRunning.
        let adapter = FakeAdapter::failing(SessionKind::AiAgent);
        let (manager, _store) = manager_with(AdapterRegistry::new().with(adapter));

        let err = manager
            .create(SessionKind::AiAgent, "/workspace", CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::StartFailed(_)));

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        let id = records[0].id.clone();
        assert_eq!(records[0].status, SessionStatus::Error);
        assert!(records[0].error_message.is_some());

        let (status, last_seq) = manager.status(&id).await.unwrap();
        assert_eq!(status, SessionStatus::Error);
        assert_eq!(last_seq, 0);

        assert!(matches!(
            manager.submit_input(&id, b"x".to_vec()).await,
            Err(ManagerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn close_is_final() {
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter));

        let id = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        manager.close(&id).await.unwrap();

        let (status, _) = manager.status(&id).await.unwrap();
        assert_eq!(status, SessionStatus::Stopped);

        let seq_after_close = store.latest_seq(&id);
        assert!(matches!(
            manager.submit_input(&id, b"late\n".to_vec()).await,
            Err(ManagerError::NotRunning(_))
        ));
        // Rejected input appends nothing.
        assert_eq!(store.latest_seq(&id), seq_after_close);

        // Closing again is a no-op.
        manager.close(&id).await.unwrap();

        // Exactly one terminal status event.
        let terminal: Vec<_> = store
            .replay(&id, 0)
            .unwrap()
            .into_iter()
            .filter(|e| {
                e.channel == EventChannel::SessionStatus && e.payload["status"] == "stopped"
            })
            .collect();
        assert_eq!(terminal.len(), 1);
    }

    #[tokio::test]
    async fn unexpected_exit_marks_error_with_diagnostic() {
        let adapter = FakeAdapter::new(SessionKind::SecondaryAgent);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));

        let id = manager
            .create(
                SessionKind::SecondaryAgent,
                "/workspace",
                CreateOptions::default(),
            )
            .await
            .unwrap()
            .id;

        adapter.emit_exit(Some(137));
        let mut errored = false;
        for _ in 0..200 {
            if manager.status(&id).await.unwrap().0 == SessionStatus::Error {
                errored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(errored);

        let events = store.replay(&id, 0).unwrap();
        assert!(events.iter().any(|e| {
            e.channel == EventChannel::SessionError && e.event_type == "adapter_crashed"
        }));
        let record = manager.get(&id).await.unwrap();
        assert!(record.error_message.unwrap().contains("137"));
    }

    #[tokio::test]
    async fn graceful_exit_stops_session() {
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));

        let id = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        adapter.emit_exit(Some(0));
        let mut stopped = false;
        for _ in 0..200 {
            if manager.status(&id).await.unwrap().0 == SessionStatus::Stopped {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped);

        let events = store.replay(&id, 0).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.channel == EventChannel::SessionStatus
                    && e.payload["status"] == "stopped")
        );
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (manager, _store) = manager_with(AdapterRegistry::new());
        let id = SessionId::from("pty-missing");
        assert!(matches!(
            manager.submit_input(&id, b"x".to_vec()).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.status(&id).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unregistered_kind_fails_to_start() {
        let (manager, _store) = manager_with(AdapterRegistry::new());
        let err = manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::StartFailed(_)));
    }

    #[tokio::test]
    async fn invalid_path_is_rejected_before_any_record() {
        let adapter = FakeAdapter::new(SessionKind::Terminal);
        let (manager, _store) = manager_with(AdapterRegistry::new().with(adapter));

        // testutil's resolver accepts everything, so exercise the real one.
        let manager = RunSessionManager::new(
            Arc::new(crate::storage::MemoryRepository::new()),
            Arc::clone(manager.store()),
            AdapterRegistry::new(),
            Arc::new(dispatch_core::collaborators::MemorySettings::new()),
            Arc::new(dispatch_core::collaborators::RootedResolver::new(
                "/workspace".into(),
            )),
        );
        let err = manager
            .create(
                SessionKind::Terminal,
                "../etc/passwd",
                CreateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidWorkspacePath(_)));
        assert!(manager.list().await.unwrap().is_empty());
    }
}
