use crate::cloud::Container;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Remote mutation requested for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Upload,
    Replace,
    Delete,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Upload => "UPLOAD",
            TaskKind::Replace => "REPLACE",
            TaskKind::Delete => "DELETE",
        })
    }
}

/// An immutable intent to mutate remote state for one (backup, path) pair.
///
/// The container the operation targets travels with the task, so consumers never
/// look provider state up by backup name.
#[derive(Debug, Clone)]
pub struct Task {
    id: Uuid,
    kind: TaskKind,
    backup: Arc<str>,
    container: Arc<Container>,
    path: PathBuf,
    key: String,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        backup: &str,
        container: Arc<Container>,
        path: PathBuf,
        key: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            backup: Arc::from(backup),
            container,
            path,
            key,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Name of the backup the file belongs to
    pub fn backup(&self) -> &str {
        &self.backup
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Local file the task is about
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Object key within the container
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{{}, {}}}", self.kind, self.backup, self.key)
    }
}
