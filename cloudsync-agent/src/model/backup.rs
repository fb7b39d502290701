use crate::config::BackupConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Database identifier of a persisted backup
pub type BackupId = i64;

/// One configured local-directory-to-container sync unit.
///
/// Records are owned by the backup but live in the metadata store; they are never
/// held on this struct. Runtime-only state (the provisioned container) lives on
/// `engine::BackupContext` and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub name: String,
    pub root: PathBuf,
}

impl Backup {
    /// Configuration entries and persisted backups are matched on name and root
    pub fn matches_config(&self, config: &BackupConfig) -> bool {
        self.name == config.name && self.root == config.root
    }

    /// Whether `path` lies under this backup's root
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

impl std::fmt::Display for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' ({})", self.name, self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_config_requires_name_and_root() {
        let backup = Backup {
            id: 1,
            name: "docs".to_string(),
            root: PathBuf::from("/data/docs"),
        };

        assert!(backup.matches_config(&BackupConfig {
            name: "docs".to_string(),
            root: PathBuf::from("/data/docs"),
        }));
        assert!(!backup.matches_config(&BackupConfig {
            name: "docs".to_string(),
            root: PathBuf::from("/data/other"),
        }));
        assert!(!backup.matches_config(&BackupConfig {
            name: "photos".to_string(),
            root: PathBuf::from("/data/docs"),
        }));
    }

    #[test]
    fn test_contains() {
        let backup = Backup {
            id: 1,
            name: "docs".to_string(),
            root: PathBuf::from("/data/docs"),
        };
        assert!(backup.contains(Path::new("/data/docs/a.txt")));
        assert!(!backup.contains(Path::new("/data/docs2/a.txt")));
    }
}
