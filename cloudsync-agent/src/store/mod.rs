//! Durable record of confirmed remote state.
//!
//! The metadata store maps (backup, path) to the last size and mtime that the
//! object store confirmed. It is the only source of truth for "already synced";
//! mutating calls are atomic per call.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::BackupConfig;
use crate::model::{Backup, LocalRecord};
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::path::{Path, MAIN_SEPARATOR};
use tracing::info;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_backups(&self) -> Result<Vec<Backup>>;

    /// Persist a configured backup; returns the existing row if already present
    async fn create_backup(&self, config: &BackupConfig) -> Result<Backup>;

    /// Remove a backup together with all of its records
    async fn delete_backup(&self, backup: &Backup) -> Result<()>;

    async fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<LocalRecord>>;

    /// Insert or overwrite the record for (backup, path). Repeating it is harmless.
    async fn upsert_record(&self, record: &LocalRecord) -> Result<()>;

    /// Remove a record; removing an absent record succeeds
    async fn delete_record(&self, record: &LocalRecord) -> Result<()>;

    /// Records whose path lies strictly below `dir`, ordered by path
    async fn records_under(&self, backup: &Backup, dir: &Path) -> Result<Vec<LocalRecord>>;

    /// Lazily stream every record of `backup` in path order. Each call starts a
    /// fresh pass.
    fn stream_records(&self, backup: &Backup) -> BoxStream<'static, Result<LocalRecord>>;
}

/// Make the persisted backup set equal the configured one.
///
/// Configured backups missing from the store are created; persisted backups no
/// longer configured are deleted along with their records. Matching is on
/// (name, root). Returns the configured backups in configuration order.
pub async fn reconcile_backups(
    store: &dyn MetadataStore,
    configured: &[BackupConfig],
) -> Result<Vec<Backup>> {
    let persisted = store.list_backups().await?;

    for backup in &persisted {
        if !configured.iter().any(|c| backup.matches_config(c)) {
            info!(backup = %backup, "Backup removed from configuration, deleting its records");
            store.delete_backup(backup).await?;
        }
    }

    let mut backups = Vec::with_capacity(configured.len());
    for config in configured {
        let backup = match persisted.iter().find(|b| b.matches_config(config)) {
            Some(existing) => existing.clone(),
            None => {
                let created = store.create_backup(config).await?;
                info!(backup = %created, "New backup registered");
                created
            }
        };
        backups.push(backup);
    }

    Ok(backups)
}

pub(crate) fn path_key(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| SyncError::Inconsistent(format!("path is not UTF-8: {}", path.display())))
}

/// Exclusive string bounds covering every path strictly below `dir`
pub(crate) fn prefix_bounds(dir: &str) -> (String, String) {
    let dir = dir.trim_end_matches(MAIN_SEPARATOR);
    // The separator's successor sorts after every "dir/..." string.
    let after = char::from_u32(MAIN_SEPARATOR as u32 + 1).unwrap_or(char::MAX);
    (format!("{dir}{MAIN_SEPARATOR}"), format!("{dir}{after}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(name: &str, root: &str) -> BackupConfig {
        BackupConfig {
            name: name.to_string(),
            root: PathBuf::from(root),
        }
    }

    #[tokio::test]
    async fn test_reconcile_creates_and_deletes() -> Result<()> {
        let store = MemoryStore::new();
        let first = reconcile_backups(
            &store,
            &[config("docs", "/data/docs"), config("photos", "/data/photos")],
        )
        .await?;
        assert_eq!(first.len(), 2);

        let kept = first[0].clone();
        let second = reconcile_backups(
            &store,
            &[config("docs", "/data/docs"), config("music", "/data/music")],
        )
        .await?;

        assert_eq!(second[0], kept);
        let names: Vec<_> = store
            .list_backups()
            .await?
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, ["docs", "music"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_matches_on_root_too() -> Result<()> {
        let store = MemoryStore::new();
        let before = reconcile_backups(&store, &[config("docs", "/data/docs")]).await?;
        let after = reconcile_backups(&store, &[config("docs", "/srv/docs")]).await?;

        assert_ne!(before[0].id, after[0].id);
        assert_eq!(store.list_backups().await?.len(), 1);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_prefix_bounds() {
        let (low, high) = prefix_bounds("/data/docs/");
        assert_eq!(low, "/data/docs/");
        assert_eq!(high, "/data/docs0");
        assert!("/data/docs/a/b" > low.as_str() && "/data/docs/a/b" < high.as_str());
        assert!("/data/docs-old/a" < low.as_str());
        assert!("/data/docs2/a" > high.as_str());
    }
}
