//! Filesystem access: depth-capped walking, live metadata reads, and change watching.

pub mod metadata;
pub mod walker;
pub mod watcher;
