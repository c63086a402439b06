//! The SQLite file behind [`Storage`]
//!
//! Records with their per-channel delivery state, the offline operation
//! queue, dead letters and small settings all live in one database. Every
//! access is serialized through a single connection; clones of [`Storage`]
//! share it.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use super::migrations::{run_migrations, SCHEMA_VERSION};
use crate::error::Result;
use crate::types::{StorageConfig, StorageMode};

const MEMORY_PATH: &str = ":memory:";

/// Settings that do not depend on the storage mode
const COMMON_PRAGMAS: &str = "PRAGMA busy_timeout=30000; PRAGMA temp_store=MEMORY;";

fn journal_pragmas(mode: StorageMode) -> &'static str {
    match mode {
        // A sidecar -wal file is fine when only this process touches the store
        StorageMode::Local => "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;",
        // File-sync tools copy single files, so nothing may live beside the db
        StorageMode::CloudSafe => "PRAGMA journal_mode=DELETE; PRAGMA synchronous=FULL;",
    }
}

/// Handle to the local sync store
#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open the store at `config.db_path`, creating the file and its parent
    /// directories on first use, and bring the schema up to date
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = if config.db_path == MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            if let Some(dir) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(dir)?;
            }
            Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };

        conn.execute_batch(journal_pragmas(config.storage_mode))?;
        conn.execute_batch(COMMON_PRAGMAS)?;
        run_migrations(&conn)?;
        tracing::debug!(
            path = %config.db_path,
            mode = ?config.storage_mode,
            schema = SCHEMA_VERSION,
            "Sync store opened"
        );

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway store for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig {
            db_path: MEMORY_PATH.to_string(),
            storage_mode: StorageMode::Local,
        })
    }

    fn is_memory(&self) -> bool {
        self.config.db_path == MEMORY_PATH
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&self.conn.lock())
    }

    /// Run `f` in one transaction; nothing it wrote survives an error
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Fold the WAL back into the database file so a copy of the file alone
    /// is complete; no-op in cloud-safe mode and for in-memory stores
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.storage_mode == StorageMode::CloudSafe || self.is_memory() {
            return Ok(());
        }
        self.conn
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn journal_mode(storage: &Storage) -> String {
        storage
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_local_mode_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(StorageConfig {
            db_path: dir.path().join("sync.db").to_string_lossy().to_string(),
            storage_mode: StorageMode::Local,
        })
        .unwrap();
        assert_eq!(journal_mode(&storage), "wal");
        storage.checkpoint().unwrap();
    }

    #[test]
    fn test_cloud_safe_mode_creates_parents_and_skips_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/sync.db");
        let storage = Storage::open(StorageConfig {
            db_path: path.to_string_lossy().to_string(),
            storage_mode: StorageMode::CloudSafe,
        })
        .unwrap();
        assert!(path.exists());
        assert_eq!(journal_mode(&storage), "delete");
        storage.checkpoint().unwrap();
        assert!(!dir.path().join("nested/sync.db-wal").exists());
    }

    #[test]
    fn test_clones_share_one_store() {
        let storage = Storage::open_in_memory().unwrap();
        let other = storage.clone();
        storage
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES ('k', 'v', 'now')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let value: String = other
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT value FROM settings WHERE key = 'k'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(value, "v");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES ('k', 'v', 'now')",
                [],
            )?;
            Err(SyncError::Internal("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
