//! Cloudsync Agent Library
//!
//! Keeps local directory trees mirrored into object storage by reconciling the
//! live filesystem, a local record of confirmed remote state, and the remote store.

pub mod cloud;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod executor;
pub mod fs;
pub mod model;
pub mod queue;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
