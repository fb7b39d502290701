//! Object store capability and provider selection.
//!
//! Providers implement [`ObjectStore`]; one is chosen from configuration at startup.
//! Each backup gets a [`Container`] from [`ObjectStore::create_container`] once, and
//! that handle is passed explicitly to every later operation for the backup.

pub mod http;
pub mod local;

#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpObjectStore;
pub use local::LocalDirStore;

use crate::config::ProviderConfig;
use crate::model::Backup;
use crate::Result;
use async_trait::async_trait;
use std::path::{Component, Path};
use std::sync::Arc;

/// Provisioned remote container for one backup. Read-only once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Backup the container was created for
    pub backup: String,

    /// Provider-side container name
    pub name: String,
}

impl Container {
    pub fn new(backup: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backup: backup.into(),
            name: name.into(),
        }
    }
}

/// Remote create-container / put / delete primitives.
///
/// `put` must be safe to repeat (last write wins) and `delete` of a missing
/// object must succeed, so duplicate task processing is harmless.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short provider name for logs
    fn provider(&self) -> &'static str;

    /// Create the backup's container if it does not exist yet
    async fn create_container(&self, backup: &Backup) -> Result<Container>;

    /// Store the contents of `source` under `key`
    async fn put(&self, container: &Container, key: &str, source: &Path) -> Result<()>;

    /// Remove the object stored under `key`
    async fn delete(&self, container: &Container, key: &str) -> Result<()>;
}

/// Build the configured provider
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config {
        ProviderConfig::Local { root } => Arc::new(LocalDirStore::new(root.clone())),
        ProviderConfig::Http { endpoint, token } => {
            Arc::new(HttpObjectStore::new(endpoint, token.clone())?)
        }
    };
    Ok(store)
}

/// Object key for `path`: relative to the parent of the backup root, `/`-separated,
/// without a leading separator. `/data/docs/sub/a.txt` under root `/data/docs`
/// becomes `docs/sub/a.txt`.
///
/// Returns `None` when `path` is outside the root's parent or not valid UTF-8.
pub fn object_key(root: &Path, path: &Path) -> Option<String> {
    let base = root.parent().unwrap_or(root);
    let relative = path.strip_prefix(base).ok()?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Container names are lowercase `[a-z0-9-]`; anything else becomes `-`.
pub fn container_name(backup_name: &str) -> String {
    let mapped: String = backup_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = mapped.trim_matches('-');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}
