//! Interfaces to external subsystems the runtime consumes but does not
//! own: settings records, auth-key validation, and workspace path
//! resolution. The session runtime only ever sees these seams.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Key/value settings accessor.
///
/// The runtime reads the `environment` category for variables injected
/// into new sessions; everything else (themes, onboarding state) belongs
/// to the owning subsystem.
#[async_trait]
pub trait SettingsAccessor: Send + Sync {
    async fn get(&self, category: &str) -> Option<Value>;
    async fn set(&self, category: &str, value: Value);
}

/// In-memory settings, for tests and single-process deployments.
#[derive(Default)]
pub struct MemorySettings {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsAccessor for MemorySettings {
    async fn get(&self, category: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(category)
            .cloned()
    }

    async fn set(&self, category: &str, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(category.to_owned(), value);
    }
}

/// Boolean gate in front of every socket.
pub trait AuthKeyValidator: Send + Sync {
    fn validate(&self, key: &str) -> bool;
}

/// Validator that accepts a single preconfigured key.
pub struct StaticKeyValidator {
    key: String,
}

impl StaticKeyValidator {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl AuthKeyValidator for StaticKeyValidator {
    fn validate(&self, key: &str) -> bool {
        // Not constant-time; the transport handles at most a handful of
        // auth attempts per socket.
        !self.key.is_empty() && self.key == key
    }
}

/// Requested path escapes the configured workspace root.
#[derive(Debug, Error)]
#[error("path escapes the workspace root: {requested}")]
pub struct OutsideWorkspace {
    pub requested: String,
}

/// Resolves client-requested paths to absolute ones, rejecting traversal
/// before the session manager ever sees them.
pub trait WorkspacePathResolver: Send + Sync {
    fn resolve(&self, requested: &str) -> Result<PathBuf, OutsideWorkspace>;
}

/// Resolver that confines every path beneath a single root.
///
/// Resolution is lexical: `..` components are rejected rather than
/// normalized, so symlink layout inside the root stays the deployment's
/// business.
pub struct RootedResolver {
    root: PathBuf,
}

impl RootedResolver {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl WorkspacePathResolver for RootedResolver {
    fn resolve(&self, requested: &str) -> Result<PathBuf, OutsideWorkspace> {
        let outside = || OutsideWorkspace {
            requested: requested.to_owned(),
        };

        let path = Path::new(requested);
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let mut resolved = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::ParentDir => return Err(outside()),
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(outside())
        }
    }
}
