//! PTY-hosted adapters: interactive shells and the AI-agent CLI.
//!
//! One driver task per process serializes writes, resizes, and stop; one
//! blocking reader thread pumps PTY output into the event channel; one
//! blocking waiter reports the exit. Nothing else ever touches the
//! process.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dispatch_core::adapter::{
    Adapter, AdapterCommand, AdapterError, AdapterEvent, AdapterHandle, StartConfig,
};
use dispatch_core::session::SessionKind;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};

use crate::shell::{UnixShell, get_interactive_shell, resolve_executable_path};

/// Grace period between a quit request and force-kill.
const STOP_GRACE: Duration = Duration::from_secs(3);

const READ_BUF: usize = 8192;

/// Interactive shell on a PTY.
pub struct TerminalAdapter;

impl TerminalAdapter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for TerminalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for TerminalAdapter {
    fn kind(&self) -> SessionKind {
        SessionKind::Terminal
    }

    async fn start(&self, config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        let cmd = if let Some(ref command) = config.command {
            parse_command(command).await?
        } else {
            let shell = get_interactive_shell().await;
            let mut cmd = CommandBuilder::new(&shell);
            if !cfg!(windows) && UnixShell::current_shell().login() {
                cmd.arg("-l");
            }
            cmd
        };

        // Shells quit on "exit"; anything custom gets the same nudge
        // before the grace period runs out.
        spawn_pty(cmd, &config, b"exit\n")
    }
}

/// AI-agent CLI on a PTY.
pub struct AgentAdapter {
    kind: SessionKind,
    default_command: String,
}

impl AgentAdapter {
    /// Adapter for the primary AI-agent CLI.
    #[must_use]
    pub fn new(default_command: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::AiAgent,
            default_command: default_command.into(),
        }
    }
}

#[async_trait]
impl Adapter for AgentAdapter {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn start(&self, config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        let command = config.command.as_deref().unwrap_or(&self.default_command);
        let cmd = parse_command(command).await?;
        spawn_pty(cmd, &config, b"/exit\r")
    }
}

/// Split a command line and resolve its program on PATH.
async fn parse_command(command: &str) -> Result<CommandBuilder, AdapterError> {
    let parts = shlex::split(command)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AdapterError::StartFailed(format!("unparseable command: {command}")))?;

    let program = resolve_executable_path(&parts[0])
        .await
        .ok_or_else(|| AdapterError::ExecutableNotFound(parts[0].clone()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&parts[1..]);
    Ok(cmd)
}

/// Open a PTY, spawn the command in it, and wire the driver.
fn spawn_pty(
    mut cmd: CommandBuilder,
    config: &StartConfig,
    quit: &'static [u8],
) -> Result<AdapterHandle, AdapterError> {
    cmd.cwd(&config.workspace_path);
    cmd.env("TERM", "xterm-256color");
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    if let Ok(home) = std::env::var("HOME") {
        cmd.env("HOME", home);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AdapterError::StartFailed(e.to_string()))?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| AdapterError::StartFailed(e.to_string()))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| AdapterError::StartFailed(e.to_string()))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AdapterError::StartFailed(e.to_string()))?;
    let master = pair.master;
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let exited = Arc::new(AtomicBool::new(false));

    let (handle, mut cmd_rx, event_tx) = AdapterHandle::channel();

    // Reader thread: blocking PTY reads pumped into the event channel.
    let read_events = event_tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if read_events
                        .send(AdapterEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(?err, "PTY read ended");
                    break;
                }
            }
        }
    });

    // Exit watcher: blocking wait, then one Exited event.
    let exit_events = event_tx.clone();
    let exited_flag = Arc::clone(&exited);
    tokio::task::spawn_blocking(move || {
        let mut child = child;
        let code = child
            .wait()
            .ok()
            .map(|status| i32::try_from(status.exit_code()).unwrap_or(i32::MAX));
        exited_flag.store(true, Ordering::SeqCst);
        let _ = exit_events.send(AdapterEvent::Exited { code });
    });

    // Driver task: sole owner of the writer and master side.
    tokio::spawn(async move {
        // Keep the master alive for the lifetime of the process; dropping
        // it closes the PTY under the child.
        let master = master;
        loop {
            match cmd_rx.recv().await {
                Some(AdapterCommand::Write(data)) => {
                    if let Err(err) = writer.write_all(&data).and_then(|()| writer.flush()) {
                        let _ = event_tx.send(AdapterEvent::Fatal {
                            message: format!("PTY write failed: {err}"),
                        });
                        break;
                    }
                }
                Some(AdapterCommand::Resize { cols, rows }) => {
                    if let Err(err) = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    }) {
                        tracing::warn!(?err, "PTY resize failed");
                    }
                }
                Some(AdapterCommand::Stop) | None => {
                    let _ = writer.write_all(quit).and_then(|()| writer.flush());
                    let exited = Arc::clone(&exited);
                    tokio::spawn(async move {
                        tokio::time::sleep(STOP_GRACE).await;
                        if !exited.load(Ordering::SeqCst) {
                            tracing::debug!("grace period elapsed, force-killing PTY child");
                            let _ = killer.kill();
                        }
                    });
                    break;
                }
            }
        }
    });

    Ok(handle)
}
