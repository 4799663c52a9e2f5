//! Redb storage backend implementation.
//!
//! Provides persistent storage using the redb embedded database. A single
//! unified table holds every record; key namespaces replace per-kind tables.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::KvBackend;
use crate::error::Result;

const UNIFIED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("unified_storage");

/// Configuration for [`RedbBackend`].
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RedbBackendConfig {
    /// Path to the database file.
    pub path: String,

    /// Create parent directories if they don't exist.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,
}

fn default_create_dirs() -> bool {
    true
}

impl RedbBackendConfig {
    /// Create a new config with the given path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
        }
    }

    /// Create a config for an in-memory database.
    pub fn memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            create_dirs: false,
        }
    }
}

/// redb-based persistent storage backend.
pub struct RedbBackend {
    db: Arc<Database>,
    path: String,
    /// Actual file path for temporary databases (for cleanup).
    temp_path: Option<PathBuf>,
}

impl RedbBackend {
    /// Create a new backend with the given configuration.
    pub fn new(config: RedbBackendConfig) -> Result<Self> {
        let path = &config.path;

        let (db, temp_path) = if path == ":memory:" {
            // redb doesn't support true in-memory databases.
            // Use a temporary file instead.
            let temp_path =
                std::env::temp_dir().join(format!("canopy_redb_{}", uuid::Uuid::new_v4()));
            let db = Database::create(&temp_path)?;
            (db, Some(temp_path))
        } else {
            let path_ref = Path::new(path);
            if config.create_dirs {
                if let Some(parent) = path_ref.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let db = if path_ref.exists() {
                Database::open(path_ref)?
            } else {
                Database::create(path_ref)?
            };
            (db, None)
        };

        // Make sure the table exists so empty reads succeed.
        let txn = db.begin_write()?;
        txn.open_table(UNIFIED_TABLE)?;
        txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            path: config.path,
            temp_path,
        })
    }

    /// Open or create a redb backend at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RedbBackendConfig::new(
            path.as_ref().to_string_lossy().to_string(),
        ))
    }

    /// Get the storage path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for RedbBackend {
    fn drop(&mut self) {
        if let Some(path) = &self.temp_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl KvBackend for RedbBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UNIFIED_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIFIED_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete_round_trip() {
        let backend = RedbBackend::new(RedbBackendConfig::memory()).unwrap();
        assert_eq!(backend.get("state:mode").unwrap(), None);
        backend.put("state:mode", b"auto").unwrap();
        assert_eq!(backend.get("state:mode").unwrap(), Some(b"auto".to_vec()));
        backend.delete("state:mode").unwrap();
        assert_eq!(backend.get("state:mode").unwrap(), None);
        // Deleting again is fine.
        backend.delete("state:mode").unwrap();
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let backend = RedbBackend::new(RedbBackendConfig::memory()).unwrap();
        backend.put("events:002", b"b").unwrap();
        backend.put("events:001", b"a").unwrap();
        backend.put("state:mode", b"auto").unwrap();
        let rows = backend.scan_prefix("events:").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["events:001", "events:002"]);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let backend = RedbBackend::open(&path).unwrap();
            backend.put("state:mode", b"manual").unwrap();
        }
        let backend = RedbBackend::open(&path).unwrap();
        assert_eq!(
            backend.get("state:mode").unwrap(),
            Some(b"manual".to_vec())
        );
    }
}
