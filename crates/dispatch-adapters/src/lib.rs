//! Process adapters for the Dispatch session runtime.
//!
//! One adapter per session kind:
//! - `TerminalAdapter` - interactive shell on a PTY
//! - `AgentAdapter` - AI-agent CLI on a PTY
//! - `RunnerAdapter` - secondary agent runtime over piped stdio
//! - `EditorAdapter` - file-editor sessions, no process

pub mod editor;
pub mod pty;
pub mod runner;
pub mod shell;

pub use editor::EditorAdapter;
pub use pty::{AgentAdapter, TerminalAdapter};
pub use runner::RunnerAdapter;
pub use shell::{get_interactive_shell, merge_paths, resolve_executable_path};
