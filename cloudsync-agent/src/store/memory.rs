//! Process-local metadata store backed by ordered maps.

use super::{path_key, prefix_bounds, MetadataStore};
use crate::config::BackupConfig;
use crate::model::{Backup, BackupId, LocalRecord};
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    next_id: BackupId,
    backups: BTreeMap<BackupId, Backup>,
    records: BTreeMap<(BackupId, String), LocalRecord>,
}

/// Keeps everything in memory; contents are lost when the process exits
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of records held for `backup`
    pub fn record_count(&self, backup: &Backup) -> usize {
        self.lock()
            .records
            .keys()
            .filter(|(id, _)| *id == backup.id)
            .count()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn list_backups(&self) -> Result<Vec<Backup>> {
        Ok(self.lock().backups.values().cloned().collect())
    }

    async fn create_backup(&self, config: &BackupConfig) -> Result<Backup> {
        let mut inner = self.lock();
        if let Some(existing) = inner.backups.values().find(|b| b.matches_config(config)) {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let backup = Backup {
            id: inner.next_id,
            name: config.name.clone(),
            root: config.root.clone(),
        };
        inner.backups.insert(backup.id, backup.clone());
        Ok(backup)
    }

    async fn delete_backup(&self, backup: &Backup) -> Result<()> {
        let mut inner = self.lock();
        inner.backups.remove(&backup.id);
        inner.records.retain(|(id, _), _| *id != backup.id);
        Ok(())
    }

    async fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<LocalRecord>> {
        let key = (backup.id, path_key(path)?.to_string());
        Ok(self.lock().records.get(&key).cloned())
    }

    async fn upsert_record(&self, record: &LocalRecord) -> Result<()> {
        self.lock()
            .records
            .insert((record.backup_id, record.path.clone()), record.clone());
        Ok(())
    }

    async fn delete_record(&self, record: &LocalRecord) -> Result<()> {
        self.lock()
            .records
            .remove(&(record.backup_id, record.path.clone()));
        Ok(())
    }

    async fn records_under(&self, backup: &Backup, dir: &Path) -> Result<Vec<LocalRecord>> {
        let (low, high) = prefix_bounds(path_key(dir)?);
        let range = (
            Bound::Included((backup.id, low)),
            Bound::Excluded((backup.id, high)),
        );
        Ok(self.lock().records.range(range).map(|(_, r)| r.clone()).collect())
    }

    fn stream_records(&self, backup: &Backup) -> BoxStream<'static, Result<LocalRecord>> {
        let snapshot: Vec<Result<LocalRecord>> = self
            .lock()
            .records
            .range((backup.id, String::new())..)
            .take_while(|((id, _), _)| *id == backup.id)
            .map(|(_, r)| Ok(r.clone()))
            .collect();
        stream::iter(snapshot).boxed()
    }
}
