//! File-editor sessions own no process.
//!
//! The session exists so that editor state flows through the same
//! sequenced log as everything else: inputs are appended by the manager
//! before they reach the adapter, every attached client replays them in
//! order, and this adapter simply has nothing further to do with them.

use async_trait::async_trait;
use dispatch_core::adapter::{
    Adapter, AdapterCommand, AdapterError, AdapterEvent, AdapterHandle, StartConfig,
};
use dispatch_core::session::SessionKind;

/// Adapter for `file-editor` sessions.
pub struct EditorAdapter;

impl EditorAdapter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for EditorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for EditorAdapter {
    fn kind(&self) -> SessionKind {
        SessionKind::FileEditor
    }

    async fn start(&self, _config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        let (handle, mut cmd_rx, event_tx) = AdapterHandle::channel();

        tokio::spawn(async move {
            loop {
                match cmd_rx.recv().await {
                    Some(AdapterCommand::Write(_) | AdapterCommand::Resize { .. }) => {}
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
