//! Uniform contract over heterogeneous child processes.
//!
//! Each adapter kind owns exactly one external process behind a driver
//! task. The handle it returns is a pair of channels: commands in, events
//! out. All process output, exit notifications, and internal errors
//! surface on the event side and nowhere else - that single funnel is
//! what makes the event store authoritative.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SessionKind;

/// Configuration handed to `Adapter::start`.
#[derive(Debug, Clone)]
pub struct StartConfig {
    /// Absolute directory the process runs in. Already validated by the
    /// workspace path resolver.
    pub workspace_path: PathBuf,
    /// Override for the adapter's default command line.
    pub command: Option<String>,
    /// Extra environment injected into the process.
    pub env: HashMap<String, String>,
    /// Initial terminal geometry, where applicable.
    pub cols: u16,
    pub rows: u16,
}

impl StartConfig {
    #[must_use]
    pub fn new(workspace_path: PathBuf) -> Self {
        Self {
            workspace_path,
            command: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    #[must_use]
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Commands accepted by an adapter's driver task.
#[derive(Debug)]
pub enum AdapterCommand {
    /// Queue bytes for the process. Never blocks the caller.
    Write(Vec<u8>),
    /// Update terminal geometry. No-op for kinds without one.
    Resize { cols: u16, rows: u16 },
    /// Graceful termination, bounded grace period, then force-kill.
    Stop,
}

/// Events emitted by an adapter's driver task, in process order.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Raw output chunk.
    Output(Bytes),
    /// Process exited. `code` is `None` when killed by signal.
    Exited { code: Option<i32> },
    /// Unrecoverable internal failure; the process is gone or unusable.
    Fatal { message: String },
}

/// Adapter error.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to start process: {0}")]
    StartFailed(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to a started process.
///
/// Commands are fire-and-forget sends into the driver task; once the
/// driver is gone (process stopped), sends become no-ops, which is what
/// makes `stop` safe to call twice.
#[derive(Debug)]
pub struct AdapterHandle {
    commands: mpsc::UnboundedSender<AdapterCommand>,
    events: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
}

impl AdapterHandle {
    /// Build a handle plus the driver-side endpoints.
    ///
    /// Adapters call this once per `start`: the returned receiver is the
    /// driver's command inbox, the sender its event outbox.
    #[must_use]
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<AdapterCommand>,
        mpsc::UnboundedSender<AdapterEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: cmd_tx,
                events: Some(event_rx),
            },
            cmd_rx,
            event_tx,
        )
    }

    /// Queue bytes for the process.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        let _ = self.commands.send(AdapterCommand::Write(data.into()));
    }

    /// Update terminal geometry.
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.commands.send(AdapterCommand::Resize { cols, rows });
    }

    /// Request termination. No-op on an already-stopped handle.
    pub fn stop(&self) {
        let _ = self.commands.send(AdapterCommand::Stop);
    }

    /// Take the event receiver. Yields `Some` exactly once; the session
    /// manager's pump task is the intended owner.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events.take()
    }
}

/// One implementation per process kind.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The session kind this adapter serves.
    fn kind(&self) -> SessionKind;

    /// Spawn the process. Calling twice for the same session is a
    /// programming error the manager never commits.
    async fn start(&self, config: StartConfig) -> Result<AdapterHandle, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_commands_reach_driver() {
        let (handle, mut cmd_rx, _event_tx) = AdapterHandle::channel();

        handle.write(b"ls\n".to_vec());
        handle.resize(120, 40);
        handle.stop();

        assert!(matches!(
            cmd_rx.recv().await,
            Some(AdapterCommand::Write(data)) if data == b"ls\n"
        ));
        assert!(matches!(
            cmd_rx.recv().await,
            Some(AdapterCommand::Resize { cols: 120, rows: 40 })
        ));
        assert!(matches!(cmd_rx.recv().await, Some(AdapterCommand::Stop)));
    }

    #[tokio::test]
    async fn stop_after_driver_gone_is_noop() {
        let (handle, cmd_rx, _event_tx) = AdapterHandle::channel();
        drop(cmd_rx);
        handle.stop();
        handle.stop();
    }

    #[tokio::test]
    async fn events_taken_once() {
        let (mut handle, _cmd_rx, _event_tx) = AdapterHandle::channel();
        assert!(handle.take_events().is_some());
        assert!(handle.take_events().is_none());
    }
}
