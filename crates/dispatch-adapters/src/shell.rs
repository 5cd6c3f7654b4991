//! Shell detection and executable resolution.

use std::collections::HashSet;
use std::env::{join_paths, split_paths};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Returns the path to an interactive shell for the current platform.
///
/// On Windows, prefers PowerShell, falling back to cmd.exe. On Unix,
/// returns the user's configured shell from `$SHELL`.
pub async fn get_interactive_shell() -> PathBuf {
    if cfg!(windows) {
        if let Some(powershell) = resolve_executable_path("powershell.exe").await {
            powershell
        } else {
            PathBuf::from("cmd.exe")
        }
    } else {
        UnixShell::current_shell().path().to_path_buf()
    }
}

/// Resolve an executable by name.
///
/// Search order:
/// 1. Explicit absolute paths.
/// 2. The current process PATH via `which`.
/// 3. A login-shell refresh of PATH (Unix), for daemons started outside a
///    login environment.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    if let Some(found) = which_async(executable).await {
        return Some(found);
    }

    if refresh_path().await {
        if let Some(found) = which_async(executable).await {
            return Some(found);
        }
    }

    None
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

async fn refresh_path() -> bool {
    let Some(refreshed) = get_fresh_path().await else {
        return false;
    };
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&existing, OsString::from(&refreshed));
    if merged == existing {
        return false;
    }
    tracing::debug!(?existing, ?refreshed, "refreshed PATH from login shell");
    // SAFETY: only the current process environment is modified.
    unsafe {
        std::env::set_var("PATH", &merged);
    }
    true
}

/// Unix shell flavors that matter for login/config semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// The user's rc file for this shell, if it exists.
    #[must_use]
    pub fn config_file(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        let config_file = match self {
            Self::Zsh(_) => Some(home.join(".zshrc")),
            Self::Bash(_) => Some(home.join(".bashrc")),
            Self::Sh(_) | Self::Other(_) => None,
        };
        config_file.filter(|p| p.is_file())
    }

    /// `source <rcfile>` with proper quoting, if an rc file exists.
    #[must_use]
    pub fn source_command(&self) -> Option<String> {
        let source_file = self.config_file()?;
        let source_file_str = source_file.to_string_lossy();
        let escaped = shlex::try_quote(source_file_str.as_ref()).ok()?;
        Some(format!("source {escaped}"))
    }

    /// The shell configured in `$SHELL`, falling back to `/bin/sh`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Classify an absolute shell path by its file name.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.is_absolute() || !path.is_file() {
            return None;
        }
        let path_buf = path.to_path_buf();
        match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Some(Self::Zsh(path_buf)),
            Some("bash") => Some(Self::Bash(path_buf)),
            Some("sh") => Some(Self::Sh(path_buf)),
            _ => Some(Self::Other(path_buf)),
        }
    }
}

#[cfg(not(windows))]
async fn get_fresh_path() -> Option<String> {
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::process::Command;

    const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

    let shell = UnixShell::current_shell();
    let mut cmd = Command::new(shell.path());
    if shell.login() {
        cmd.arg("-l");
    }
    if let Some(source_command) = shell.source_command() {
        cmd.arg("-c")
            .arg(format!("{source_command}; printf '%s' \"$PATH\""));
    } else {
        cmd.arg("-c").arg("printf '%s' \"$PATH\"");
    }
    cmd.env("TERM", "dumb")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(shell = %shell.path().display(), ?err, "failed to read PATH from login shell");
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.path().display(), "timed out reading PATH from login shell");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if path.is_empty() { None } else { Some(path) }
}

#[cfg(windows)]
async fn get_fresh_path() -> Option<String> {
    // `which` already consults the process PATH; there is no login-shell
    // equivalent worth shelling out for on Windows.
    None
}
