//! SQLite metadata store on an r2d2 connection pool.
//!
//! All queries run on the blocking pool. Writes additionally take a process-wide
//! writer lock so record mutations are serialized and never race on SQLite's
//! database lock.

use super::{path_key, prefix_bounds, MetadataStore};
use crate::config::BackupConfig;
use crate::model::{Backup, BackupId, LocalRecord};
use crate::utils::errors::{Result, SyncError};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  root_directory TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  UNIQUE (name, root_directory)
);

CREATE TABLE IF NOT EXISTS records (
  backup_id INTEGER NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  modified_ms INTEGER NOT NULL,
  size INTEGER NOT NULL,
  synced_at TEXT NOT NULL,
  PRIMARY KEY (backup_id, path)
) WITHOUT ROWID;
"#;

/// Records fetched per round trip while streaming
const PAGE_SIZE: usize = 512;

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema up to date
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(SyncError::Config(format!(
                "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        tracing::info!("[DB] Schema ready (version {})", SCHEMA_VERSION);
        Ok(())
    }

    /// Flush the WAL into the main database file
    pub fn close(&self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
        }
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let _guard = writer.lock().unwrap_or_else(|e| e.into_inner());
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn row_to_backup(row: &Row) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: row.get("id")?,
        name: row.get("name")?,
        root: PathBuf::from(row.get::<_, String>("root_directory")?),
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<LocalRecord> {
    Ok(LocalRecord {
        backup_id: row.get("backup_id")?,
        path: row.get("path")?,
        modified_ms: row.get("modified_ms")?,
        size: row.get::<_, i64>("size")? as u64,
    })
}

fn find_backup(conn: &Connection, config: &BackupConfig, root: &str) -> Result<Option<Backup>> {
    let backup = conn
        .query_row(
            "SELECT id, name, root_directory FROM backups WHERE name = ?1 AND root_directory = ?2",
            params![config.name, root],
            row_to_backup,
        )
        .optional()?;
    Ok(backup)
}

fn records_page(conn: &Connection, backup_id: BackupId, after: &str) -> Result<Vec<LocalRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT backup_id, path, modified_ms, size FROM records
         WHERE backup_id = ?1 AND path > ?2
         ORDER BY path LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![backup_id, after, PAGE_SIZE as i64], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, root_directory FROM backups ORDER BY id")?;
            let rows = stmt.query_map([], row_to_backup)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn create_backup(&self, config: &BackupConfig) -> Result<Backup> {
        let config = config.clone();
        let root = path_key(&config.root)?.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO backups (name, root_directory) VALUES (?1, ?2)
                 ON CONFLICT (name, root_directory) DO NOTHING",
                params![config.name, root],
            )?;
            find_backup(conn, &config, &root)?
                .ok_or_else(|| SyncError::Inconsistent("failed to retrieve created backup".into()))
        })
        .await
    }

    async fn delete_backup(&self, backup: &Backup) -> Result<()> {
        let id = backup.id;
        self.write(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM records WHERE backup_id = ?1", params![id])?;
            tx.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<LocalRecord>> {
        let id = backup.id;
        let path = path_key(path)?.to_string();
        self.read(move |conn| {
            let record = conn
                .query_row(
                    "SELECT backup_id, path, modified_ms, size FROM records
                     WHERE backup_id = ?1 AND path = ?2",
                    params![id, path],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn upsert_record(&self, record: &LocalRecord) -> Result<()> {
        let record = record.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO records (backup_id, path, modified_ms, size, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (backup_id, path) DO UPDATE SET
                   modified_ms = excluded.modified_ms,
                   size = excluded.size,
                   synced_at = excluded.synced_at",
                params![
                    record.backup_id,
                    record.path,
                    record.modified_ms,
                    record.size as i64,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_record(&self, record: &LocalRecord) -> Result<()> {
        let (id, path) = (record.backup_id, record.path.clone());
        self.write(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE backup_id = ?1 AND path = ?2",
                params![id, path],
            )?;
            Ok(())
        })
        .await
    }

    async fn records_under(&self, backup: &Backup, dir: &Path) -> Result<Vec<LocalRecord>> {
        let id = backup.id;
        let (low, high) = prefix_bounds(path_key(dir)?);
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT backup_id, path, modified_ms, size FROM records
                 WHERE backup_id = ?1 AND path >= ?2 AND path < ?3
                 ORDER BY path",
            )?;
            let rows = stmt.query_map(params![id, low, high], row_to_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    fn stream_records(&self, backup: &Backup) -> BoxStream<'static, Result<LocalRecord>> {
        let pool = self.pool.clone();
        let backup_id = backup.id;

        // Keyset pagination on path: each page starts after the last path seen.
        stream::try_unfold(Some(String::new()), move |cursor| {
            let pool = pool.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };

                let page = tokio::task::spawn_blocking(move || {
                    let conn = pool.get()?;
                    records_page(&conn, backup_id, &after)
                })
                .await??;

                let next = if page.len() < PAGE_SIZE {
                    None
                } else {
                    page.last().map(|r| r.path.clone())
                };
                Ok::<_, SyncError>(Some((stream::iter(page.into_iter().map(Ok::<_, SyncError>)), next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::FileState;
    use crate::store::reconcile_backups;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(&dir.path().join("state/cloudsync.db"), 2).unwrap()
    }

    fn docs() -> BackupConfig {
        BackupConfig {
            name: "docs".to_string(),
            root: PathBuf::from("/data/docs"),
        }
    }

    fn record(backup: &Backup, path: &str, size: u64, modified_ms: i64) -> LocalRecord {
        LocalRecord::observed(backup, Path::new(path), &FileState { size, modified_ms }).unwrap()
    }

    #[tokio::test]
    async fn test_create_backup_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir);

        let first = store.create_backup(&docs()).await?;
        let second = store.create_backup(&docs()).await?;

        assert_eq!(first, second);
        assert_eq!(store.list_backups().await?, vec![first]);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir);
        let backup = store.create_backup(&docs()).await?;
        let path = Path::new("/data/docs/a.txt");

        assert_eq!(store.get_record(&backup, path).await?, None);

        store.upsert_record(&record(&backup, "/data/docs/a.txt", 10, 1_000)).await?;
        store.upsert_record(&record(&backup, "/data/docs/a.txt", 20, 2_000)).await?;

        let stored = store.get_record(&backup, path).await?.unwrap();
        assert_eq!((stored.size, stored.modified_ms), (20, 2_000));

        store.delete_record(&stored).await?;
        store.delete_record(&stored).await?;
        assert_eq!(store.get_record(&backup, path).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_spans_pages() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir);
        let backup = store.create_backup(&docs()).await?;

        let total = PAGE_SIZE + 3;
        for i in 0..total {
            let path = format!("/data/docs/f{i:05}");
            store.upsert_record(&record(&backup, &path, 1, 1)).await?;
        }

        let records: Vec<LocalRecord> = store.stream_records(&backup).try_collect().await?;
        assert_eq!(records.len(), total);
        assert!(records.windows(2).all(|w| w[0].path < w[1].path));

        // A second pass starts from the beginning again.
        let again: Vec<LocalRecord> = store.stream_records(&backup).try_collect().await?;
        assert_eq!(again.len(), total);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_deletes_records_of_removed_backup() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open(&dir);
        let backups = reconcile_backups(&store, &[docs()]).await?;
        store
            .upsert_record(&record(&backups[0], "/data/docs/a", 1, 1))
            .await?;

        reconcile_backups(&store, &[]).await?;

        assert!(store.list_backups().await?.is_empty());
        let orphaned: Vec<LocalRecord> = store.stream_records(&backups[0]).try_collect().await?;
        assert!(orphaned.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() -> Result<()> {
        let dir = TempDir::new()?;
        let backup = {
            let store = open(&dir);
            let backup = store.create_backup(&docs()).await?;
            store.upsert_record(&record(&backup, "/data/docs/a", 5, 7)).await?;
            store.close();
            backup
        };

        let store = open(&dir);
        let stored = store.get_record(&backup, Path::new("/data/docs/a")).await?;
        assert_eq!(stored.map(|r| r.size), Some(5));
        Ok(())
    }
}
