//! Device-code authorization over a session's own I/O channel.
//!
//! A narrow state machine layered on one AI-agent session: `begin` sends
//! the login command and watches the session's output stream for the
//! authorization URL; while a code is awaited, the next client input is
//! the code rather than a session command. The mode switch is explicit
//! state - message shape is never inspected to classify input.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dispatch_core::event::EventChannel;
use dispatch_core::repository::SessionRepository;
use dispatch_core::session::SessionId;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::manager::{ManagerError, RunSessionManager};

/// Keep this much trailing output for marker matching.
const SCAN_BUFFER_MAX: usize = 16 * 1024;

/// Authorization machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Idle,
    StartRequested,
    AwaitingCode,
    Authenticated,
    Error,
}

/// What became of a piece of client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    /// Consumed as the authorization code.
    Intercepted,
    /// Ordinary session input; the caller forwards it as usual.
    Passthrough,
}

/// Auth error.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

struct SessionAuth {
    state: AuthState,
    code_submitted: bool,
}

/// Drives the device-code exchange for AI-agent sessions.
pub struct ClaudeAuthManager<R: SessionRepository> {
    manager: Arc<RunSessionManager<R>>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionAuth>>>,
    login_command: String,
    success_marker: String,
    failure_marker: String,
}

impl<R: SessionRepository + 'static> ClaudeAuthManager<R> {
    #[must_use]
    pub fn new(manager: Arc<RunSessionManager<R>>) -> Self {
        Self {
            manager,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            login_command: "/login".to_owned(),
            success_marker: "Login successful".to_owned(),
            failure_marker: "Login failed".to_owned(),
        }
    }

    /// Current machine state for a session.
    #[must_use]
    pub fn state(&self, session_id: &SessionId) -> AuthState {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .map_or(AuthState::Idle, |auth| auth.state)
    }

    /// Start the exchange: send the login command and watch the session's
    /// output for the authorization URL.
    ///
    /// # Errors
    /// `AlreadyInProgress` unless the machine is idle; manager errors when
    /// the session cannot take input.
    pub async fn begin(&self, session_id: &SessionId) -> Result<(), AuthError> {
        {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let auth = sessions.entry(session_id.clone()).or_insert(SessionAuth {
                state: AuthState::Idle,
                code_submitted: false,
            });
            if !matches!(
                auth.state,
                AuthState::Idle | AuthState::Authenticated | AuthState::Error
            ) {
                return Err(AuthError::AlreadyInProgress);
            }
            auth.state = AuthState::StartRequested;
            auth.code_submitted = false;
        }

        let store = Arc::clone(self.manager.store());
        store.append(
            session_id,
            EventChannel::AuthStatus,
            "status",
            json!({ "state": AuthState::StartRequested }),
        );

        // Subscribe before sending the command so the URL cannot slip
        // past between the write and the watch.
        let stream = store.subscribe_live(session_id);

        let command = format!("{}\r", self.login_command);
        if let Err(err) = self
            .manager
            .submit_input(session_id, command.into_bytes())
            .await
        {
            self.reset(session_id);
            return Err(err.into());
        }

        self.spawn_scanner(session_id.clone(), stream);
        Ok(())
    }

    /// Route one piece of client input through the machine.
    ///
    /// In `awaiting_code` the first input is consumed as the code and fed
    /// to the process; everything else passes through untouched.
    pub async fn intercept_input(
        &self,
        session_id: &SessionId,
        data: &[u8],
    ) -> InputDisposition {
        let should_intercept = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match sessions.get_mut(session_id) {
                Some(auth) if auth.state == AuthState::AwaitingCode && !auth.code_submitted => {
                    auth.code_submitted = true;
                    true
                }
                _ => false,
            }
        };

        if !should_intercept {
            return InputDisposition::Passthrough;
        }

        let mut code = data.to_vec();
        if !code.ends_with(b"\r") && !code.ends_with(b"\n") {
            code.push(b'\r');
        }
        if let Err(err) = self.manager.submit_input(session_id, code).await {
            tracing::warn!(session_id = %session_id, ?err, "failed to submit authorization code");
            self.manager.store().append(
                session_id,
                EventChannel::AuthError,
                "error",
                json!({ "message": err.to_string() }),
            );
            self.reset(session_id);
        }
        InputDisposition::Intercepted
    }

    fn reset(&self, session_id: &SessionId) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(auth) = sessions.get_mut(session_id) {
            auth.state = AuthState::Idle;
            auth.code_submitted = false;
        }
    }

    /// Watch the session's output stream and advance the machine.
    fn spawn_scanner(
        &self,
        session_id: SessionId,
        mut stream: futures::stream::BoxStream<
            'static,
            Result<dispatch_core::event::Event, dispatch_core::store::StoreError>,
        >,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let store = Arc::clone(self.manager.store());
        let success_marker = self.success_marker.clone();
        let failure_marker = self.failure_marker.clone();

        tokio::spawn(async move {
            let mut buffer = String::new();

            while let Some(Ok(event)) = stream.next().await {
                match event.channel {
                    EventChannel::SessionOutput => {}
                    EventChannel::SessionStatus => {
                        // The session ended under us; the exchange is over.
                        let finished = event
                            .payload
                            .get("status")
                            .and_then(|s| s.as_str())
                            .is_some_and(|s| s == "stopped" || s == "error");
                        if finished {
                            store.append(
                                &session_id,
                                EventChannel::AuthError,
                                "error",
                                json!({ "message": "session ended during authorization" }),
                            );
                            reset_in(&sessions, &session_id);
                            break;
                        }
                        continue;
                    }
                    _ => continue,
                }

                let Some(chunk) = event
                    .payload
                    .get("data")
                    .and_then(|d| d.as_str())
                    .and_then(|d| BASE64.decode(d).ok())
                else {
                    continue;
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                if buffer.len() > SCAN_BUFFER_MAX {
                    let cut = buffer.len() - SCAN_BUFFER_MAX;
                    buffer.drain(..cut);
                }

                let state = {
                    let sessions = sessions
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    sessions
                        .get(&session_id)
                        .map_or(AuthState::Idle, |auth| auth.state)
                };

                match state {
                    AuthState::StartRequested => {
                        if let Some(url) = find_url(&buffer) {
                            store.append(
                                &session_id,
                                EventChannel::AuthUrl,
                                "url",
                                json!({ "url": url }),
                            );
                            store.append(
                                &session_id,
                                EventChannel::AuthStatus,
                                "status",
                                json!({ "state": AuthState::AwaitingCode }),
                            );
                            let mut sessions = sessions
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            if let Some(auth) = sessions.get_mut(&session_id) {
                                auth.state = AuthState::AwaitingCode;
                            }
                            buffer.clear();
                        }
                    }
                    AuthState::AwaitingCode => {
                        if buffer.contains(&success_marker) {
                            store.append(
                                &session_id,
                                EventChannel::AuthSuccess,
                                "success",
                                json!({}),
                            );
                            reset_in(&sessions, &session_id);
                            break;
                        }
                        if buffer.contains(&failure_marker) {
                            store.append(
                                &session_id,
                                EventChannel::AuthError,
                                "error",
                                json!({ "message": "authorization rejected" }),
                            );
                            reset_in(&sessions, &session_id);
                            break;
                        }
                    }
                    // Reset from outside; nothing left to watch.
                    _ => break,
                }
            }
            tracing::debug!(session_id = %session_id, "auth scanner finished");
        });
    }
}

fn reset_in(sessions: &Mutex<HashMap<SessionId, SessionAuth>>, session_id: &SessionId) {
    let mut sessions = sessions
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(auth) = sessions.get_mut(session_id) {
        auth.state = AuthState::Idle;
        auth.code_submitted = false;
    }
}

/// First https URL in the buffer, trimmed at whitespace or quote.
fn find_url(buffer: &str) -> Option<String> {
    let start = buffer.find("https://")?;
    let rest = &buffer[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .unwrap_or(rest.len());
    let url = &rest[..end];
    // A bare scheme is noise, not a URL.
    if url.len() > "https://".len() {
        Some(url.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{AdapterRegistry, CreateOptions};
    use crate::testutil::{FakeAdapter, manager_with};
    use dispatch_core::session::SessionKind;
    use dispatch_core::store::EventStore;
    use std::time::Duration;

    async fn wait_for_write(adapter: &FakeAdapter, expected: &[u8]) {
        for _ in 0..200 {
            if adapter.written().iter().any(|w| w == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("write {expected:?} never reached the adapter");
    }

    async fn wait_for_channel(
        store: &EventStore,
        session_id: &SessionId,
        channel: EventChannel,
    ) -> Vec<dispatch_core::event::Event> {
        for _ in 0..200 {
            match store.replay(session_id, 0) {
                Ok(events) => {
                    let hits: Vec<_> = events
                        .into_iter()
                        .filter(|e| e.channel == channel)
                        .collect();
                    if !hits.is_empty() {
                        return hits;
                    }
                }
                Err(err) => panic!("replay failed: {err}"),
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no event on {channel:?} within deadline");
    }

    #[test]
    fn url_extraction() {
        assert_eq!(
            find_url("visit https://auth.example.com/device?c=1 to continue"),
            Some("https://auth.example.com/device?c=1".to_owned())
        );
        assert_eq!(find_url("no url here"), None);
        assert_eq!(find_url("broken https:// tail"), None);
    }

    #[tokio::test]
    async fn device_code_exchange_happy_path() {
        let adapter = FakeAdapter::new(SessionKind::AiAgent);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));
        let auth = ClaudeAuthManager::new(Arc::clone(&manager));

        let record = manager
            .create(SessionKind::AiAgent, "/workspace", CreateOptions::default())
            .await
            .unwrap();
        let id = record.id.clone();

        auth.begin(&id).await.unwrap();
        assert_eq!(auth.state(&id), AuthState::StartRequested);
        // The login command reached the process.
        wait_for_write(&adapter, b"/login\r").await;

        adapter.emit_output(b"Open https://auth.example.com/device?code=XYZ to authorize\n");
        let urls = wait_for_channel(&store, &id, EventChannel::AuthUrl).await;
        assert_eq!(urls.len(), 1);
        assert_eq!(
            urls[0].payload["url"],
            "https://auth.example.com/device?code=XYZ"
        );
        assert_eq!(auth.state(&id), AuthState::AwaitingCode);

        // The next input is the code, not a session command.
        let disposition = auth.intercept_input(&id, b"AUTH123").await;
        assert_eq!(disposition, InputDisposition::Intercepted);
        wait_for_write(&adapter, b"AUTH123\r").await;

        adapter.emit_output(b"Login successful\n");
        let successes = wait_for_channel(&store, &id, EventChannel::AuthSuccess).await;
        assert_eq!(successes.len(), 1);
        assert_eq!(auth.state(&id), AuthState::Idle);

        // Identical input after authentication is ordinary session input.
        let disposition = auth.intercept_input(&id, b"AUTH123").await;
        assert_eq!(disposition, InputDisposition::Passthrough);

        // Still exactly one success event.
        let successes: Vec<_> = store
            .replay(&id, 0)
            .unwrap()
            .into_iter()
            .filter(|e| e.channel == EventChannel::AuthSuccess)
            .collect();
        assert_eq!(successes.len(), 1);
    }

    #[tokio::test]
    async fn rejected_code_emits_error_and_resets() {
        let adapter = FakeAdapter::new(SessionKind::AiAgent);
        let (manager, store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));
        let auth = ClaudeAuthManager::new(Arc::clone(&manager));

        let id = manager
            .create(SessionKind::AiAgent, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        auth.begin(&id).await.unwrap();
        adapter.emit_output(b"https://auth.example.com/device\n");
        wait_for_channel(&store, &id, EventChannel::AuthUrl).await;

        auth.intercept_input(&id, b"WRONG").await;
        adapter.emit_output(b"Login failed: invalid code\n");
        wait_for_channel(&store, &id, EventChannel::AuthError).await;
        assert_eq!(auth.state(&id), AuthState::Idle);
    }

    #[tokio::test]
    async fn idle_input_is_always_passthrough() {
        let adapter = FakeAdapter::new(SessionKind::AiAgent);
        let (manager, _store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));
        let auth = ClaudeAuthManager::new(Arc::clone(&manager));

        let id = manager
            .create(SessionKind::AiAgent, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        // Even something that looks like a code is a command while idle.
        let disposition = auth.intercept_input(&id, b"AUTH123").await;
        assert_eq!(disposition, InputDisposition::Passthrough);
    }

    #[tokio::test]
    async fn begin_twice_is_rejected() {
        let adapter = FakeAdapter::new(SessionKind::AiAgent);
        let (manager, _store) =
            manager_with(AdapterRegistry::new().with(adapter.clone()));
        let auth = ClaudeAuthManager::new(Arc::clone(&manager));

        let id = manager
            .create(SessionKind::AiAgent, "/workspace", CreateOptions::default())
            .await
            .unwrap()
            .id;

        auth.begin(&id).await.unwrap();
        assert!(matches!(
            auth.begin(&id).await,
            Err(AuthError::AlreadyInProgress)
        ));
    }
}
