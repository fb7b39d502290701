//! Live file state used for change detection.
//!
//! Only size and modification time (millisecond precision) take part in drift
//! detection; content is never hashed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Size and modification time of a regular file as observed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (milliseconds since Unix epoch, negative before it)
    pub modified_ms: i64,
}

impl FileState {
    /// Build from already-fetched metadata
    pub fn from_metadata(metadata: &fs::Metadata) -> io::Result<Self> {
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            size: metadata.len(),
            modified_ms: modified.timestamp_millis(),
        })
    }

    /// Extract state from a file path (follows symlinks)
    pub fn from_path(path: &Path) -> io::Result<Self> {
        Self::from_metadata(&fs::metadata(path)?)
    }
}

/// What a path currently points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    File(FileState),
    Directory,
    Missing,
    /// Sockets, fifos, devices: never synced
    Special,
}

/// Re-read a path without blocking the runtime.
///
/// A vanished path is `Ok(Probe::Missing)`; any other failure (permissions,
/// transient I/O) is returned as the error.
pub async fn probe(path: &Path) -> io::Result<Probe> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Probe::File(FileState::from_metadata(&metadata)?)),
        Ok(metadata) if metadata.is_dir() => Ok(Probe::Directory),
        Ok(_) => Ok(Probe::Special),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Probe::Missing),
        Err(e) => Err(e),
    }
}
