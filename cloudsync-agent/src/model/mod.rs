//! Data model: backups and the records of their files.

pub mod backup;
pub mod record;

pub use backup::{Backup, BackupId};
pub use record::LocalRecord;
