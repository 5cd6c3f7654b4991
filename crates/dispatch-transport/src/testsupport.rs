//! Test doubles for driving the router with no sockets or processes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dispatch_core::adapter::{
    Adapter, AdapterCommand, AdapterError, AdapterEvent, AdapterHandle, StartConfig,
};
use dispatch_core::collaborators::{MemorySettings, RootedResolver, StaticKeyValidator};
use dispatch_core::session::SessionKind;
use dispatch_core::store::EventStore;
use dispatch_session::auth::ClaudeAuthManager;
use dispatch_session::manager::{AdapterRegistry, RunSessionManager};
use dispatch_session::storage::MemoryRepository;

use crate::websocket::RouterState;

/// Echoes every write straight back as output. Deterministic stand-in for
/// a real process.
pub struct LoopbackAdapter {
    kind: SessionKind,
}

impl LoopbackAdapter {
    pub fn new(kind: SessionKind) -> Arc<Self> {
        Arc::new(Self { kind })
    }
}

#[async_trait]
impl Adapter for LoopbackAdapter {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn start(&self, _config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        let (handle, mut cmd_rx, event_tx) = AdapterHandle::channel();
        tokio::spawn(async move {
            loop {
                match cmd_rx.recv().await {
                    Some(AdapterCommand::Write(data)) => {
                        let _ = event_tx.send(AdapterEvent::Output(Bytes::from(data)));
                    }
                    Some(AdapterCommand::Resize { .. }) => {}
                    Some(AdapterCommand::Stop) | None => {
                        let _ = event_tx.send(AdapterEvent::Exited { code: Some(0) });
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

/// Always fails to spawn, as if the runtime binary were missing.
pub struct FailingAdapter {
    kind: SessionKind,
}

impl FailingAdapter {
    pub fn new(kind: SessionKind) -> Arc<Self> {
        Arc::new(Self { kind })
    }
}

#[async_trait]
impl Adapter for FailingAdapter {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn start(&self, _config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        Err(AdapterError::StartFailed("missing runtime".into()))
    }
}

/// Router state wired with loopback adapters and a static key.
pub fn make_state(key: &str) -> RouterState<MemoryRepository> {
    let store = Arc::new(EventStore::new());
    let registry = AdapterRegistry::new()
        .with(LoopbackAdapter::new(SessionKind::Terminal))
        .with(LoopbackAdapter::new(SessionKind::AiAgent))
        .with(FailingAdapter::new(SessionKind::SecondaryAgent));

    let manager = Arc::new(RunSessionManager::new(
        Arc::new(MemoryRepository::new()),
        store,
        registry,
        Arc::new(MemorySettings::new()),
        Arc::new(RootedResolver::new(PathBuf::from("/"))),
    ));
    let auth = Arc::new(ClaudeAuthManager::new(Arc::clone(&manager)));

    RouterState {
        manager,
        auth,
        validator: Arc::new(StaticKeyValidator::new(key)),
    }
}
