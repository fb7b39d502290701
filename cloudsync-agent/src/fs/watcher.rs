//! Live directory-tree watcher on top of `notify`.
//!
//! Every directory is registered individually so that directories created after
//! startup can be added (with their subtree) before later events are handled.
//! Raw notifications are normalized into [`WatchEvent`]s; a dropped or coalesced
//! notification batch surfaces as [`WatchEventKind::Overflow`].

use super::walker::{walk_dirs, walk_files, WalkOptions};
use crate::utils::errors::{Result, SyncError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Deleted,
    /// Notifications were lost; the tree has to be swept again
    Overflow,
}

/// One normalized change. For `Overflow` the path is the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self { kind, path }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Register subdirectories, including ones created later
    pub recursive: bool,

    /// Deepest directory level registered below the root
    pub max_depth: usize,

    /// Pause after each notification batch
    pub pause: Duration,
}

type RawEvent = notify::Result<Event>;

pub struct DirWatcher {
    root: PathBuf,
    options: WatchOptions,
    watcher: RecommendedWatcher,
    raw: mpsc::UnboundedReceiver<RawEvent>,
    watched: HashSet<PathBuf>,
}

impl DirWatcher {
    /// Register `root` (and its subtree when recursive). Changes made after this
    /// returns are reported by [`DirWatcher::run`].
    pub async fn start(root: &Path, options: WatchOptions) -> Result<Self> {
        let (tx, raw) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |event: RawEvent| {
            let _ = tx.send(event);
        })?;

        let mut this = Self {
            root: root.to_path_buf(),
            options,
            watcher,
            raw,
            watched: HashSet::new(),
        };

        let registered = this.register_tree(root).await?;
        info!(root = %root.display(), directories = registered, "Watching directory tree");
        Ok(this)
    }

    /// Deliver events to `events` until cancelled, until every watched directory
    /// is gone, or until the receiver is dropped.
    ///
    /// Returns `Err` only if the notification backend stops.
    pub async fn run(mut self, events: mpsc::UnboundedSender<WatchEvent>, cancel: CancellationToken) -> Result<()> {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                raw = self.raw.recv() => raw,
            };
            let Some(first) = first else {
                return Err(SyncError::Inconsistent(format!(
                    "notification backend for {} stopped",
                    self.root.display()
                )));
            };

            let mut batch = vec![first];
            while let Ok(raw) = self.raw.try_recv() {
                batch.push(raw);
            }

            let mut removals = false;
            for raw in batch {
                for event in self.normalize(raw).await {
                    removals |= event.kind == WatchEventKind::Deleted;
                    if events.send(event).is_err() {
                        debug!(root = %self.root.display(), "Event consumer gone, watcher stopping");
                        return Ok(());
                    }
                }
            }

            if removals && !self.root.exists() {
                self.watched.clear();
            }
            if self.watched.is_empty() {
                warn!(root = %self.root.display(), "No watched directories left, watcher stopping");
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.options.pause) => {}
            }
        }
    }

    async fn normalize(&mut self, raw: RawEvent) -> Vec<WatchEvent> {
        let event = match raw {
            Ok(event) => event,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Watch error, forcing a rescan");
                return vec![WatchEvent::new(WatchEventKind::Overflow, self.root.clone())];
            }
        };

        let mut out = Vec::new();
        if event.need_rescan() {
            out.push(WatchEvent::new(WatchEventKind::Overflow, self.root.clone()));
        }

        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in event.paths {
                    self.created(path, &mut out).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for path in event.paths {
                    self.deleted(path, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let Some(from) = paths.next() {
                    self.deleted(from, &mut out);
                }
                if let Some(to) = paths.next() {
                    self.created(to, &mut out).await;
                }
            }
            // Rename halves we cannot pair: decide by what is on disk now.
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    if path.exists() {
                        self.created(path, &mut out).await;
                    } else {
                        self.deleted(path, &mut out);
                    }
                }
            }
            EventKind::Modify(_) | EventKind::Any => {
                out.extend(
                    event
                        .paths
                        .into_iter()
                        .map(|p| WatchEvent::new(WatchEventKind::Modified, p)),
                );
            }
            EventKind::Access(_) | EventKind::Other => {}
        }
        out
    }

    async fn created(&mut self, path: PathBuf, out: &mut Vec<WatchEvent>) {
        let is_dir = tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);
        out.push(WatchEvent::new(WatchEventKind::Created, path.clone()));

        if !is_dir || !self.options.recursive || self.watched.contains(&path) {
            return;
        }

        if let Err(e) = self.register_tree(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to watch new directory");
            out.push(WatchEvent::new(WatchEventKind::Overflow, self.root.clone()));
            return;
        }

        // Files written before the new directory was registered produced no event.
        let depth = self.remaining_depth(&path);
        let existing = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let options = WalkOptions {
                follow_links: false,
                max_depth: depth,
            };
            let _ = walk_files(&path, &options, |file| {
                files.push(file);
                ControlFlow::Continue(())
            });
            files
        })
        .await
        .unwrap_or_default();

        out.extend(
            existing
                .into_iter()
                .map(|p| WatchEvent::new(WatchEventKind::Created, p)),
        );
    }

    fn deleted(&mut self, path: PathBuf, out: &mut Vec<WatchEvent>) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|dir| dir.starts_with(&path))
            .cloned()
            .collect();
        for dir in gone {
            // The backend usually drops the watch itself once the inode is gone.
            let _ = self.watcher.unwatch(&dir);
            self.watched.remove(&dir);
        }
        out.push(WatchEvent::new(WatchEventKind::Deleted, path));
    }

    /// Register `dir` and, when recursive, every directory below it
    async fn register_tree(&mut self, dir: &Path) -> Result<usize> {
        let dirs = if self.options.recursive {
            let (dir, depth) = (dir.to_path_buf(), self.remaining_depth(dir));
            let (dirs, depth_exceeded) = tokio::task::spawn_blocking(move || walk_dirs(&dir, depth)).await??;
            if depth_exceeded > 0 {
                debug!(root = %self.root.display(), skipped = depth_exceeded, "Directories left unwatched");
            }
            dirs
        } else {
            vec![dir.to_path_buf()]
        };

        let mut registered = 0;
        for dir in dirs {
            if self.watched.contains(&dir) {
                continue;
            }
            match self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.watched.insert(dir);
                    registered += 1;
                }
                // Removed between listing and registration
                Err(e) if matches!(e.kind, notify::ErrorKind::PathNotFound) => {}
                Err(e) if dir == self.root => return Err(e.into()),
                Err(e) => warn!(path = %dir.display(), error = %e, "Failed to watch directory"),
            }
        }
        Ok(registered)
    }

    fn remaining_depth(&self, dir: &Path) -> usize {
        let depth = dir
            .strip_prefix(&self.root)
            .map(|rel| rel.components().count())
            .unwrap_or(0);
        self.options.max_depth.saturating_sub(depth)
    }
}
