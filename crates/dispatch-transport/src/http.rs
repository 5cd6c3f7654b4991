//! REST read endpoints.
//!
//! Thin wrappers over the same `EventStore::replay` and session listing
//! the socket uses. The socket's `session_attach` is the canonical replay
//! path; nothing here is a second source of truth.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    routing::get,
};
use dispatch_core::event::Event;
use dispatch_core::repository::SessionRepository;
use dispatch_core::session::{SessionId, SessionRecord};
use dispatch_core::store::StoreError;
use serde::{Deserialize, Serialize};

use crate::protocol::ErrorKind;
use crate::websocket::RouterState;

/// Structured rejection body, mirroring the socket's error frames.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: ErrorKind,
    pub message: String,
}

type Rejection = (StatusCode, Json<ErrorBody>);

fn reject(status: StatusCode, error: ErrorKind, message: impl Into<String>) -> Rejection {
    (
        status,
        Json(ErrorBody {
            ok: false,
            error,
            message: message.into(),
        }),
    )
}

fn authorize<R: SessionRepository>(
    state: &RouterState<R>,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Result<(), Rejection> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let key = bearer.or(query_key).unwrap_or_default();
    if state.validator.validate(key) {
        Ok(())
    } else {
        Err(reject(
            StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthorized,
            "invalid key",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    from_seq: u64,
    #[serde(default)]
    key: Option<String>,
}

/// REST routes, to be merged into the main router.
#[must_use]
pub fn rest_router<R: SessionRepository + 'static>() -> Router<RouterState<R>> {
    Router::new()
        .route("/sessions", get(list_sessions::<R>))
        .route("/sessions/{id}/events", get(session_events::<R>))
}

async fn list_sessions<R: SessionRepository + 'static>(
    State(state): State<RouterState<R>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionRecord>>, Rejection> {
    authorize(&state, &headers, query.key.as_deref())?;
    state.manager.list().await.map(Json).map_err(|err| {
        reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            err.to_string(),
        )
    })
}

async fn session_events<R: SessionRepository + 'static>(
    State(state): State<RouterState<R>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, Rejection> {
    authorize(&state, &headers, query.key.as_deref())?;

    let session_id = SessionId::from(id);
    if state.manager.get(&session_id).await.is_err() {
        return Err(reject(
            StatusCode::NOT_FOUND,
            ErrorKind::NotFound,
            format!("session not found: {session_id}"),
        ));
    }

    match state.manager.store().replay(&session_id, query.from_seq) {
        Ok(events) => Ok(Json(events)),
        Err(err @ StoreError::HistoryUnavailable { .. }) => Err(reject(
            StatusCode::GONE,
            ErrorKind::HistoryUnavailable,
            err.to_string(),
        )),
        Err(err) => Err(reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            err.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::testsupport::make_state;
    use crate::websocket::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use dispatch_core::session::SessionKind;
    use dispatch_session::manager::CreateOptions;
    use tower::ServiceExt;

    #[tokio::test]
    async fn rest_requires_key() {
        let state = make_state("k3y");
        let router = create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rest_lists_sessions_with_bearer_key() {
        let state = make_state("k3y");
        state
            .manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap();
        let router = create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .header("authorization", "Bearer k3y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rest_replays_events() {
        let state = make_state("k3y");
        let record = state
            .manager
            .create(SessionKind::Terminal, "/workspace", CreateOptions::default())
            .await
            .unwrap();
        let router = create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/sessions/{}/events?key=k3y&from_seq=0", record.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rest_unknown_session_is_404() {
        let state = make_state("k3y");
        let router = create_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sessions/pty-nope/events?key=k3y")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
