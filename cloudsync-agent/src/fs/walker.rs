//! Depth-capped directory traversal.
//!
//! Unreadable entries are logged and skipped so a single bad directory never
//! aborts the walk. Entries deeper than the cap are counted and reported rather
//! than silently dropped.

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Deepest level visited; the root is level 0, its children level 1
    pub max_depth: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: 10_000,
        }
    }
}

/// Counters from one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Regular files handed to the callback
    pub files: usize,

    /// Entries that could not be read
    pub errors: usize,

    /// Entries found below `max_depth` and not visited
    pub depth_exceeded: usize,

    /// The callback asked to stop early
    pub stopped: bool,
}

/// Walk `root` and call `callback` for every regular file.
///
/// Returns `Err` only when the root itself cannot be read. The callback can stop
/// the walk by returning `ControlFlow::Break`.
pub fn walk_files<F>(root: &Path, options: &WalkOptions, mut callback: F) -> io::Result<WalkSummary>
where
    F: FnMut(PathBuf) -> ControlFlow<()>,
{
    let mut summary = WalkSummary::default();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .max_depth(options.max_depth.saturating_add(1));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(into_io(e)),
            Err(e) => {
                summary.errors += 1;
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.depth() > options.max_depth {
            if summary.depth_exceeded == 0 {
                warn!(
                    root = %root.display(),
                    path = %entry.path().display(),
                    max_depth = options.max_depth,
                    "Directory depth limit exceeded, deeper entries are not synced"
                );
            }
            summary.depth_exceeded += 1;
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        summary.files += 1;
        if callback(entry.into_path()).is_break() {
            summary.stopped = true;
            break;
        }
    }

    Ok(summary)
}

/// Collect `root` and every directory below it, up to `max_depth` levels.
///
/// Also returns how many directories sit just past the cap and were left out.
pub fn walk_dirs(root: &Path, max_depth: usize) -> io::Result<(Vec<PathBuf>, usize)> {
    let mut dirs = Vec::new();
    let mut depth_exceeded = 0;

    for entry in WalkDir::new(root).max_depth(max_depth.saturating_add(1)) {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                if entry.depth() > max_depth {
                    if depth_exceeded == 0 {
                        warn!(
                            root = %root.display(),
                            path = %entry.path().display(),
                            max_depth,
                            "Directory depth limit exceeded, deeper directories are not watched"
                        );
                    }
                    depth_exceeded += 1;
                } else {
                    dirs.push(entry.into_path());
                }
            }
            Ok(_) => {}
            Err(e) if e.depth() == 0 => return Err(into_io(e)),
            Err(e) => warn!(root = %root.display(), error = %e, "Skipping unreadable directory"),
        }
    }

    Ok((dirs, depth_exceeded))
}

fn into_io(e: walkdir::Error) -> io::Error {
    let message = e.to_string();
    e.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
}
