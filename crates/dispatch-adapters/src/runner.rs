//! Secondary-agent runtime over piped stdio.
//!
//! The runtime is a headless, line-oriented process. It runs in its own
//! process group so stop can take the whole tree down, and its stdout and
//! stderr are line-framed into the single ordered event stream.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use command_group::AsyncCommandGroup;
use dispatch_core::adapter::{
    Adapter, AdapterCommand, AdapterError, AdapterEvent, AdapterHandle, StartConfig,
};
use dispatch_core::session::SessionKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::shell::resolve_executable_path;

/// Grace period between closing stdin and force-killing the group.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Secondary agent runtime adapter.
pub struct RunnerAdapter {
    default_command: String,
}

impl RunnerAdapter {
    #[must_use]
    pub fn new(default_command: impl Into<String>) -> Self {
        Self {
            default_command: default_command.into(),
        }
    }
}

#[async_trait]
impl Adapter for RunnerAdapter {
    fn kind(&self) -> SessionKind {
        SessionKind::SecondaryAgent
    }

    async fn start(&self, config: StartConfig) -> Result<AdapterHandle, AdapterError> {
        let command = config.command.as_deref().unwrap_or(&self.default_command);
        let parts = shlex::split(command)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AdapterError::StartFailed(format!("unparseable command: {command}")))?;

        let program = resolve_executable_path(&parts[0])
            .await
            .ok_or_else(|| AdapterError::ExecutableNotFound(parts[0].clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(&parts[1..])
            .current_dir(&config.workspace_path)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .group_spawn()
            .map_err(|e| AdapterError::StartFailed(e.to_string()))?;

        let mut stdin = child
            .inner()
            .stdin
            .take()
            .ok_or_else(|| AdapterError::StartFailed("runner stdin unavailable".into()))?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| AdapterError::StartFailed("runner stdout unavailable".into()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| AdapterError::StartFailed("runner stderr unavailable".into()))?;

        let (handle, mut cmd_rx, event_tx) = AdapterHandle::channel();

        spawn_line_pump(stdout, event_tx.clone());
        spawn_line_pump(stderr, event_tx.clone());

        // Driver task: owns the child and its stdin.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        let _ = event_tx.send(AdapterEvent::Exited { code });
                        return;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(AdapterCommand::Write(data)) => {
                            if let Err(err) = write_line(&mut stdin, &data).await {
                                let _ = event_tx.send(AdapterEvent::Fatal {
                                    message: format!("runner stdin write failed: {err}"),
                                });
                                return;
                            }
                        }
                        // No terminal geometry.
                        Some(AdapterCommand::Resize { .. }) => {}
                        Some(AdapterCommand::Stop) | None => break,
                    },
                }
            }

            // Closing stdin asks a line-oriented runtime to drain and exit.
            drop(stdin);
            let code = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => status.ok().and_then(|s| s.code()),
                Err(_) => {
                    tracing::debug!("grace period elapsed, killing runner process group");
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            let _ = event_tx.send(AdapterEvent::Exited { code });
        });

        Ok(handle)
    }
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    data: &[u8],
) -> std::io::Result<()> {
    stdin.write_all(data).await?;
    if !data.ends_with(b"\n") {
        stdin.write_all(b"\n").await?;
    }
    stdin.flush().await
}

fn spawn_line_pump(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    events: mpsc::UnboundedSender<AdapterEvent>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(mut line)) = lines.next_line().await {
            line.push('\n');
            if events.send(AdapterEvent::Output(Bytes::from(line))).is_err() {
                break;
            }
        }
    });
}
