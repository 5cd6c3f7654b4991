//! Test doubles for exercising the manager without real processes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dispatch_core::adapter::{
    Adapter, AdapterCommand, AdapterError, AdapterEvent, AdapterHandle, StartConfig,
};
use dispatch_core::collaborators::{MemorySettings, OutsideWorkspace, WorkspacePathResolver};
use dispatch_core::session::SessionKind;
use dispatch_core::store::EventStore;
use tokio::sync::mpsc::UnboundedSender;

use crate::manager::{AdapterRegistry, RunSessionManager};
use crate::storage::MemoryRepository;

/// Scripted adapter: records writes, lets tests emit output and exits.
pub struct FakeAdapter {
    kind: SessionKind,
    fail_start: bool,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    event_tx: Mutex<Option<UnboundedSender<AdapterEvent>>>,
}

impl FakeAdapter {
    pub fn new(kind: SessionKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_start: false,
            written: Arc::new(Mutex::new(Vec::new())),
            event_tx: Mutex::new(None),
        })
    }

    /// Adapter whose `start` always fails, as if the runtime were missing.
    pub fn failing(kind: SessionKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_start: true,
            written: Arc::new(Mutex::new(Vec::new())),
            event_tx: Mutex::new(None),
        })
    }

    /// Emit process output for the most recently started session.
    pub fn emit_output(&self, data: &[u8]) {
        let guard = self.event_tx.lock().unwrap();
        let tx = guard.as_ref().expect("no session started");
        tx.send(AdapterEvent::Output(Bytes::copy_from_slice(data)))
            .expect("pump gone");
    }

    /// Emit a process exit for the most recently started session.
    pub fn emit_exit(&self, code: Option<i32>) {
        let guard = self.event_tx.lock().unwrap();
        let tx = guard.as_ref().expect("no session started");
        let _ = tx.send(AdapterEvent::Exited { code });
    }

    /// Everything written to the process so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn start(&self, _config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        if self.fail_start {
            return Err(AdapterError::StartFailed("missing runtime".into()));
        }

        let (handle, mut cmd_rx, event_tx) = AdapterHandle::channel();
        *self.event_tx.lock().unwrap() = Some(event_tx.clone());

        let written = Arc::clone(&self.written);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    AdapterCommand::Write(data) => written.lock().unwrap().push(data),
                    AdapterCommand::Resize { .. } => {}
                    AdapterCommand::Stop => {
                        let _ = event_tx.send(AdapterEvent::Exited { code: Some(0) });
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }
}

/// Resolver that accepts everything relative to a fixed root.
pub struct AnyPathResolver;

impl WorkspacePathResolver for AnyPathResolver {
    fn resolve(&self, requested: &str) -> Result<PathBuf, OutsideWorkspace> {
        let path = PathBuf::from(requested);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(PathBuf::from("/workspace").join(path))
        }
    }
}

/// Manager wired with fakes, ready for lifecycle tests.
pub fn manager_with(
    adapters: AdapterRegistry,
) -> (Arc<RunSessionManager<MemoryRepository>>, Arc<EventStore>) {
    let store = Arc::new(EventStore::new());
    let manager = Arc::new(RunSessionManager::new(
        Arc::new(MemoryRepository::new()),
        Arc::clone(&store),
        adapters,
        Arc::new(MemorySettings::new()),
        Arc::new(AnyPathResolver),
    ));
    (manager, store)
}
