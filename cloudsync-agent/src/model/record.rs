use crate::fs::metadata::FileState;
use crate::model::backup::{Backup, BackupId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

/// Last confirmed-synced snapshot of one file.
///
/// At most one record exists per (backup, path). Records are created, updated and
/// deleted only after the object store has confirmed the matching operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub backup_id: BackupId,

    /// Absolute path, compared as a string
    pub path: String,

    /// Modification time in milliseconds since the Unix epoch
    pub modified_ms: i64,

    /// Size in bytes
    pub size: u64,
}

impl LocalRecord {
    /// Snapshot `state` for `path`. Returns `None` for paths that are not valid UTF-8.
    pub fn observed(backup: &Backup, path: &Path, state: &FileState) -> Option<Self> {
        Some(Self {
            backup_id: backup.id,
            path: path.to_str()?.to_string(),
            modified_ms: state.modified_ms,
            size: state.size,
        })
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// True iff the path string is unchanged and both size and mtime are equal.
    pub fn matches(&self, path: &Path, current: &FileState) -> bool {
        path.to_str() == Some(self.path.as_str())
            && current.modified_ms == self.modified_ms
            && current.size == self.size
    }

    /// Take on a newly confirmed state, keeping identity
    pub fn refresh(&mut self, current: &FileState) {
        self.modified_ms = current.modified_ms;
        self.size = current.size;
    }
}

impl PartialOrd for LocalRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Records of one backup sort by path for deterministic diffing.
impl Ord for LocalRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.backup_id
            .cmp(&other.backup_id)
            .then_with(|| self.path.cmp(&other.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backup() -> Backup {
        Backup {
            id: 7,
            name: "docs".to_string(),
            root: PathBuf::from("/data/docs"),
        }
    }

    #[test]
    fn test_matches_on_equal_state() {
        let state = FileState { size: 10, modified_ms: 1_000 };
        let path = Path::new("/data/docs/a.txt");
        let record = LocalRecord::observed(&backup(), path, &state).unwrap();

        assert!(record.matches(path, &state));
    }

    #[test]
    fn test_stale_on_size_mtime_or_path() {
        let state = FileState { size: 10, modified_ms: 1_000 };
        let path = Path::new("/data/docs/a.txt");
        let record = LocalRecord::observed(&backup(), path, &state).unwrap();

        assert!(!record.matches(path, &FileState { size: 20, modified_ms: 1_000 }));
        assert!(!record.matches(path, &FileState { size: 10, modified_ms: 2_000 }));
        assert!(!record.matches(Path::new("/data/docs/b.txt"), &state));
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let path = Path::new("/data/docs/a.txt");
        let mut record =
            LocalRecord::observed(&backup(), path, &FileState { size: 10, modified_ms: 1 }).unwrap();

        record.refresh(&FileState { size: 20, modified_ms: 2 });

        assert_eq!(record.backup_id, 7);
        assert_eq!(record.path, "/data/docs/a.txt");
        assert_eq!((record.size, record.modified_ms), (20, 2));
    }

    #[test]
    fn test_records_sort_by_path() {
        let state = FileState { size: 1, modified_ms: 1 };
        let mut records = vec![
            LocalRecord::observed(&backup(), Path::new("/data/docs/c"), &state).unwrap(),
            LocalRecord::observed(&backup(), Path::new("/data/docs/a"), &state).unwrap(),
            LocalRecord::observed(&backup(), Path::new("/data/docs/b"), &state).unwrap(),
        ];
        records.sort();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["/data/docs/a", "/data/docs/b", "/data/docs/c"]);
    }
}
