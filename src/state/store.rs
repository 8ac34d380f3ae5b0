//! redb-backed state database
//!
//! Database: state.redb
//! Tables:
//!   - tunnels: tunnel id -> PersistedTunnel (MessagePack)
//!   - tunnel_metadata: key -> MessagePack value (schema version)

#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::{error, info, warn};

/// Database version for migrations
pub const STATE_DB_VERSION: u32 = 1;

/// Table: tunnels (key: tunnel id, value: MessagePack bytes)
pub(crate) const TUNNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnels");

/// Table: metadata (key: string, value: MessagePack bytes)
const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnel_metadata");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StateError {
    fn from(e: tokio::task::JoinError) -> Self {
        StateError::Task(e.to_string())
    }
}

/// Handle to the state database
pub struct StateStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl StateStore {
    /// Open (or create) the database at `path`.
    ///
    /// A file that cannot be opened is moved aside to `*.redb.backup` and a
    /// fresh database is created in its place.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::create(&path) {
            Ok(db) => {
                info!("State database opened at {:?}", path);
                db
            }
            Err(e) => {
                warn!("Failed to open state database: {:?}, attempting recovery", e);

                let backup_path = path.with_extension("redb.backup");
                if let Err(e) = std::fs::rename(&path, &backup_path) {
                    error!("Failed to backup corrupted state database: {:?}", e);
                } else {
                    info!("Backed up corrupted state database to {:?}", backup_path);
                }

                Database::create(&path)?
            }
        };

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("Failed to set state database permissions: {}", e);
            }
        }

        let store = Self {
            db: Arc::new(db),
            path,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&self) -> Result<(), StateError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(TUNNELS_TABLE)?;
            let _ = write_txn.open_table(METADATA_TABLE)?;
        }
        write_txn.commit()?;

        self.check_version()
    }

    /// Stamp the schema version. Older versions have no migrations yet.
    fn check_version(&self) -> Result<(), StateError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(METADATA_TABLE)?;

            let existing = table
                .get("version")?
                .and_then(|v| rmp_serde::from_slice::<u32>(v.value()).ok());

            match existing {
                Some(version) if version > STATE_DB_VERSION => {
                    warn!(
                        "State database v{} is newer than supported v{}",
                        version, STATE_DB_VERSION
                    );
                }
                Some(version) if version == STATE_DB_VERSION => {}
                _ => {
                    let bytes = rmp_serde::to_vec(&STATE_DB_VERSION)?;
                    table.insert("version", bytes.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<u32>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA_TABLE)?;
        let version = table
            .get("version")?
            .map(|v| rmp_serde::from_slice::<u32>(v.value()))
            .transpose()?;
        Ok(version)
    }

    pub(crate) fn put(&self, key: &str, value: &[u8]) -> Result<(), StateError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Read-modify-write of one value inside a single write transaction.
    /// `None` from `update` leaves the value untouched. Returns whether a
    /// value was written.
    pub(crate) fn update<F>(&self, key: &str, update: F) -> Result<bool, StateError>
    where
        F: FnOnce(&[u8]) -> Result<Option<Vec<u8>>, StateError>,
    {
        let write_txn = self.db.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            let current = table.get(key)?.map(|v| v.value().to_vec());
            match current {
                Some(bytes) => match update(&bytes)? {
                    Some(next) => {
                        table.insert(key, next.as_slice())?;
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(written)
    }

    pub(crate) fn delete(&self, key: &str) -> Result<bool, StateError> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    pub(crate) fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_stamps_version() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.redb")).unwrap();
        assert_eq!(store.schema_version().unwrap(), Some(STATE_DB_VERSION));
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.redb")).unwrap();

        store.put("a", b"one").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.scan().unwrap().len(), 1);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_update_missing_key_is_noop() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.redb")).unwrap();
        let written = store.update("nope", |_| Ok(Some(b"x".to_vec()))).unwrap();
        assert!(!written);
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");
        std::fs::write(&path, b"definitely not a redb file").unwrap();

        let store = StateStore::new(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), Some(STATE_DB_VERSION));
        assert!(path.with_extension("redb.backup").exists());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::new(&path).unwrap();
            store.put("a", b"one").unwrap();
        }
        let store = StateStore::new(&path).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"one"[..]));
    }
}
