//! WebSocket session router.
//!
//! All per-socket behavior lives in `Connection`, which is constructed
//! with its collaborators and an outbound sink - unit tests drive it with
//! a plain channel and no socket. The axum handler is a thin shell that
//! normalizes frames at the ingress and feeds them in.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dispatch_core::collaborators::AuthKeyValidator;
use dispatch_core::repository::SessionRepository;
use dispatch_core::session::SessionId;
use dispatch_core::store::StoreError;
use dispatch_session::auth::{AuthError, ClaudeAuthManager, InputDisposition};
use dispatch_session::manager::{CreateOptions, ManagerError, RunSessionManager};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::protocol::{ClientMessage, ErrorKind, ServerMessage};

/// Shared collaborators for every connection.
pub struct RouterState<R: SessionRepository> {
    pub manager: Arc<RunSessionManager<R>>,
    pub auth: Arc<ClaudeAuthManager<R>>,
    pub validator: Arc<dyn AuthKeyValidator>,
}

impl<R: SessionRepository> Clone for RouterState<R> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            auth: Arc::clone(&self.auth),
            validator: Arc::clone(&self.validator),
        }
    }
}

/// Per-socket state machine: auth gate, attachments, request dispatch.
pub struct Connection<R: SessionRepository> {
    state: RouterState<R>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    authenticated: bool,
    attachments: HashMap<SessionId, JoinHandle<()>>,
}

impl<R: SessionRepository + 'static> Connection<R> {
    #[must_use]
    pub fn new(state: RouterState<R>, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            state,
            outbound,
            authenticated: false,
            attachments: HashMap::new(),
        }
    }

    fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(msg);
    }

    fn reject(&self, id: Option<u64>, error: ErrorKind, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            id,
            error,
            message: message.into(),
        });
    }

    /// Dispatch one client message.
    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Ping => self.send(ServerMessage::Pong),
            ClientMessage::Auth { id, key } => {
                if self.state.validator.validate(&key) {
                    self.authenticated = true;
                    self.send(ServerMessage::Ok { id });
                } else {
                    self.reject(Some(id), ErrorKind::Unauthorized, "invalid key");
                }
            }
            msg if !self.authenticated => {
                self.reject(
                    request_id(&msg),
                    ErrorKind::NotAuthenticated,
                    "authenticate first",
                );
            }
            ClientMessage::SessionCreate {
                id,
                kind,
                workspace_path,
                cols,
                rows,
                command,
            } => {
                let opts = CreateOptions { cols, rows, command };
                match self.state.manager.create(kind, &workspace_path, opts).await {
                    Ok(record) => self.send(ServerMessage::SessionCreated {
                        id,
                        session_id: record.id.to_string(),
                    }),
                    Err(err) => self.reject(Some(id), manager_error_kind(&err), err.to_string()),
                }
            }
            ClientMessage::SessionAttach {
                id,
                session_id,
                from_seq,
            } => {
                self.attach(id, SessionId::from(session_id), from_seq).await;
            }
            ClientMessage::SessionInput { session_id, data } => {
                let session_id = SessionId::from(session_id);
                let Ok(bytes) = BASE64.decode(&data) else {
                    self.reject(None, ErrorKind::BadRequest, "input is not valid base64");
                    return;
                };
                // The auth machine may claim this input as its code.
                if self.state.auth.intercept_input(&session_id, &bytes).await
                    == InputDisposition::Intercepted
                {
                    return;
                }
                if let Err(err) = self.state.manager.submit_input(&session_id, bytes).await {
                    self.reject(None, manager_error_kind(&err), err.to_string());
                }
            }
            ClientMessage::SessionResize {
                session_id,
                cols,
                rows,
            } => {
                let session_id = SessionId::from(session_id);
                match self.state.manager.resize(&session_id, cols, rows).await {
                    Ok(()) => {
                        // Geometry changed; whatever the client was
                        // painting as "catching up" is stale now.
                        let seq = self.state.manager.store().latest_seq(&session_id);
                        self.send(ServerMessage::CaughtUp {
                            session_id: session_id.to_string(),
                            seq,
                        });
                    }
                    Err(err) => self.reject(None, manager_error_kind(&err), err.to_string()),
                }
            }
            ClientMessage::SessionDetach { session_id } => {
                let session_id = SessionId::from(session_id);
                if let Some(task) = self.attachments.remove(&session_id) {
                    task.abort();
                }
            }
            ClientMessage::SessionClose { id, session_id } => {
                let session_id = SessionId::from(session_id);
                match self.state.manager.close(&session_id).await {
                    Ok(()) => self.send(ServerMessage::Ok { id }),
                    Err(err) => self.reject(Some(id), manager_error_kind(&err), err.to_string()),
                }
            }
            ClientMessage::SessionStatus { id, session_id } => {
                let session_id = SessionId::from(session_id);
                match self.state.manager.status(&session_id).await {
                    Ok((status, last_seq)) => self.send(ServerMessage::Status {
                        id,
                        session_id: session_id.to_string(),
                        status,
                        last_seq,
                    }),
                    Err(err) => self.reject(Some(id), manager_error_kind(&err), err.to_string()),
                }
            }
            ClientMessage::SessionList { id } => match self.state.manager.list().await {
                Ok(sessions) => self.send(ServerMessage::Sessions { id, sessions }),
                Err(err) => self.reject(Some(id), manager_error_kind(&err), err.to_string()),
            },
            ClientMessage::AgentLogin { id, session_id } => {
                let session_id = SessionId::from(session_id);
                match self.state.auth.begin(&session_id).await {
                    Ok(()) => self.send(ServerMessage::Ok { id }),
                    Err(AuthError::AlreadyInProgress) => self.reject(
                        Some(id),
                        ErrorKind::BadRequest,
                        "authorization already in progress",
                    ),
                    Err(AuthError::Manager(err)) => {
                        self.reject(Some(id), manager_error_kind(&err), err.to_string());
                    }
                }
            }
        }
    }

    /// Attach this socket to a session's event stream.
    ///
    /// The store registers the live listener before snapshotting history,
    /// so the forwarded stream is gap-free and duplicate-free; a
    /// `caught_up` marker is sent at the replay/live boundary.
    async fn attach(&mut self, id: u64, session_id: SessionId, from_seq: Option<u64>) {
        if let Err(err) = self.state.manager.get(&session_id).await {
            self.reject(Some(id), manager_error_kind(&err), err.to_string());
            return;
        }

        let store = self.state.manager.store();
        let boundary = store.latest_seq(&session_id);
        let from = from_seq.unwrap_or(boundary);

        let stream = match store.subscribe_from(&session_id, from) {
            Ok(stream) => stream,
            Err(err) => {
                self.reject(Some(id), store_error_kind(&err), err.to_string());
                return;
            }
        };

        // Re-attaching replaces the previous attachment for the session.
        if let Some(previous) = self.attachments.remove(&session_id) {
            previous.abort();
        }

        self.send(ServerMessage::Ok { id });

        let already_caught_up = from >= boundary;
        if already_caught_up {
            self.send(ServerMessage::CaughtUp {
                session_id: session_id.to_string(),
                seq: boundary,
            });
        }

        let outbound = self.outbound.clone();
        let sid = session_id.clone();
        let task = tokio::spawn(async move {
            let mut stream = stream;
            let mut caught_up = already_caught_up;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        let seq = event.seq;
                        if outbound.send(ServerMessage::Event { event }).is_err() {
                            break;
                        }
                        if !caught_up && seq >= boundary {
                            caught_up = true;
                            let _ = outbound.send(ServerMessage::CaughtUp {
                                session_id: sid.to_string(),
                                seq,
                            });
                        }
                    }
                    Err(err) => {
                        let _ = outbound.send(ServerMessage::Error {
                            id: None,
                            error: store_error_kind(&err),
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
        });
        self.attachments.insert(session_id, task);
    }
}

impl<R: SessionRepository> Drop for Connection<R> {
    fn drop(&mut self) {
        // Socket gone: cancel replay/forwarding immediately. Sessions are
        // untouched - disconnects are not errors.
        for task in self.attachments.values() {
            task.abort();
        }
    }
}

fn request_id(msg: &ClientMessage) -> Option<u64> {
    match msg {
        ClientMessage::Auth { id, .. }
        | ClientMessage::SessionCreate { id, .. }
        | ClientMessage::SessionAttach { id, .. }
        | ClientMessage::SessionClose { id, .. }
        | ClientMessage::SessionStatus { id, .. }
        | ClientMessage::SessionList { id }
        | ClientMessage::AgentLogin { id, .. } => Some(*id),
        ClientMessage::SessionInput { .. }
        | ClientMessage::SessionResize { .. }
        | ClientMessage::SessionDetach { .. }
        | ClientMessage::Ping => None,
    }
}

fn manager_error_kind(err: &ManagerError) -> ErrorKind {
    match err {
        ManagerError::NotFound(_) => ErrorKind::NotFound,
        ManagerError::NotRunning(_) => ErrorKind::NotRunning,
        ManagerError::StartFailed(_) => ErrorKind::StartFailed,
        ManagerError::InvalidWorkspacePath(_) => ErrorKind::InvalidWorkspacePath,
        ManagerError::Repository(dispatch_core::repository::RepositoryError::NotFound(_)) => {
            ErrorKind::NotFound
        }
        ManagerError::Repository(_) => ErrorKind::Internal,
    }
}

fn store_error_kind(err: &StoreError) -> ErrorKind {
    match err {
        // A lagged subscriber has the same remedy as a pruned range:
        // re-attach from the last acked seq.
        StoreError::HistoryUnavailable { .. } | StoreError::Lagged { .. } => {
            ErrorKind::HistoryUnavailable
        }
    }
}

/// Build the axum router: WebSocket endpoint plus REST reads.
#[must_use]
pub fn create_router<R: SessionRepository + 'static>(state: RouterState<R>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<R>))
        .merge(crate::http::rest_router::<R>())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler<R: SessionRepository + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<RouterState<R>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket<R: SessionRepository + 'static>(socket: WebSocket, state: RouterState<R>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Forward outbound messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    tracing::error!(?err, "failed to serialize message");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state, tx.clone());

    while let Some(msg) = receiver.next().await {
        // Normalize every frame shape into one canonical text form here;
        // nothing downstream branches on how it arrived.
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(?err, "websocket receive error");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(?err, "invalid client message");
                let _ = tx.send(ServerMessage::Error {
                    id: None,
                    error: ErrorKind::BadRequest,
                    message: format!("invalid message: {err}"),
                });
                continue;
            }
        };

        connection.handle(client_msg).await;
    }

    drop(connection);
    send_task.abort();
    tracing::debug!("websocket disconnected");
}
