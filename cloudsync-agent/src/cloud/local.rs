//! Directory-backed object store.
//!
//! Each container is a subdirectory of the store root and each object key maps to
//! a file path below it. Writes go to a temporary sibling first and are renamed
//! into place, so a reader never sees a half-written object.

use super::{container_name, Container, ObjectStore};
use crate::model::Backup;
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn container_dir(&self, container: &Container) -> PathBuf {
        self.root.join(&container.name)
    }

    fn object_path(&self, container: &Container, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(SyncError::Remote(format!("invalid object key '{key}'")));
        }
        Ok(self.container_dir(container).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    fn provider(&self) -> &'static str {
        "local"
    }

    async fn create_container(&self, backup: &Backup) -> Result<Container> {
        let container = Container::new(&backup.name, container_name(&backup.name));
        tokio::fs::create_dir_all(self.container_dir(&container)).await?;
        Ok(container)
    }

    async fn put(&self, container: &Container, key: &str, source: &Path) -> Result<()> {
        let dest = self.object_path(container, key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| SyncError::Remote(format!("invalid object key '{key}'")))?;
        tokio::fs::create_dir_all(parent).await?;

        let staging = parent.join(format!(".{}.partial", Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(source, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(container = %container.name, key, "Stored object");
        Ok(())
    }

    async fn delete(&self, container: &Container, key: &str) -> Result<()> {
        let target = self.object_path(container, key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Prune directories left empty, stopping at the container itself.
        let top = self.container_dir(container);
        let mut dir = target.parent();
        while let Some(current) = dir {
            if current == top || tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }

        debug!(container = %container.name, key, "Deleted object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backup() -> Backup {
        Backup {
            id: 1,
            name: "Docs".to_string(),
            root: PathBuf::from("/data/docs"),
        }
    }

    #[tokio::test]
    async fn test_put_overwrite_and_delete() -> Result<()> {
        let objects = TempDir::new()?;
        let files = TempDir::new()?;
        let store = LocalDirStore::new(objects.path().to_path_buf());

        let container = store.create_container(&backup()).await?;
        assert_eq!(container.name, "docs");
        // Creating again is a no-op.
        store.create_container(&backup()).await?;

        let source = files.path().join("a.txt");
        std::fs::write(&source, b"first")?;
        store.put(&container, "docs/sub/a.txt", &source).await?;

        let stored = objects.path().join("docs/docs/sub/a.txt");
        assert_eq!(std::fs::read(&stored)?, b"first");

        std::fs::write(&source, b"second")?;
        store.put(&container, "docs/sub/a.txt", &source).await?;
        assert_eq!(std::fs::read(&stored)?, b"second");

        store.delete(&container, "docs/sub/a.txt").await?;
        assert!(!stored.exists());
        assert!(!objects.path().join("docs/docs").exists());
        assert!(objects.path().join("docs").exists());

        // Deleting a missing object succeeds.
        store.delete(&container, "docs/sub/a.txt").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() -> Result<()> {
        let objects = TempDir::new()?;
        let store = LocalDirStore::new(objects.path().to_path_buf());
        let container = store.create_container(&backup()).await?;

        let result = store.delete(&container, "../outside").await;
        assert!(matches!(result, Err(SyncError::Remote(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_put_missing_source_fails() -> Result<()> {
        let objects = TempDir::new()?;
        let store = LocalDirStore::new(objects.path().to_path_buf());
        let container = store.create_container(&backup()).await?;

        let result = store
            .put(&container, "docs/a.txt", &objects.path().join("missing"))
            .await;
        assert!(matches!(result, Err(SyncError::Io(_))));
        assert!(!objects.path().join("docs/docs/a.txt").exists());
        Ok(())
    }
}
