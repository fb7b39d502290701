//! Per-(backup, path) mutual exclusion for decide-and-apply.

use crate::model::BackupId;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Key = (BackupId, PathBuf);

/// Lazily created lock per path. Entries are dropped again once nobody holds or
/// waits on them, so the map only grows with in-flight work.
#[derive(Default)]
pub struct PathLocks {
    locks: DashMap<Key, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, backup: BackupId, path: &Path) -> PathGuard<'_> {
        let key = (backup, path.to_path_buf());
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        PathGuard {
            locks: self,
            key,
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Paths currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    key: Key,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's own reference is gone before counting.
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
