//! ReDB storage implementation.
//!
//! Vaults are keyed by their ECDSA root public key and stored as JSON.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{KeysignError, KeysignResult};
use crate::vault::{Vault, VaultStore};

const VAULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("vaults");

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> KeysignResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| KeysignError::Storage(e.to_string()))?;
        let storage = Self::init(db)?;

        tracing::info!(path = %path.display(), "Opened vault database");
        Ok(storage)
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> KeysignResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| KeysignError::Storage(e.to_string()))?;
        Self::init(db)
    }

    fn init(db: Database) -> KeysignResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(VAULTS)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn delete_vault(&self, id: &str) -> KeysignResult<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(VAULTS)?;
            table.remove(id)?.is_some()
        };
        write_txn.commit()?;

        if deleted {
            tracing::debug!(vault_id = id, "Deleted vault");
        }
        Ok(deleted)
    }
}

impl VaultStore for Storage {
    fn get(&self, id: &str) -> KeysignResult<Vault> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VAULTS)?;

        match table.get(id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Err(KeysignError::VaultNotFound(id.to_string())),
        }
    }

    fn upsert(&self, vault: &Vault) -> KeysignResult<()> {
        let value = serde_json::to_vec(vault)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VAULTS)?;
            table.insert(vault.id(), value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::debug!(vault_id = vault.id(), name = %vault.name, "Stored vault");
        Ok(())
    }

    fn list(&self) -> KeysignResult<Vec<Vault>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VAULTS)?;

        table
            .iter()?
            .map(|entry| -> KeysignResult<Vault> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(value.value())?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::tests::sample_vault;

    #[test]
    fn test_vault_crud() -> KeysignResult<()> {
        let storage = Storage::open_memory()?;
        let vault = sample_vault("a", &["a", "b", "c"]);

        storage.upsert(&vault)?;
        assert_eq!(storage.get(vault.id())?, vault);

        let mut renamed = vault.clone();
        renamed.name = "Renamed".to_string();
        storage.upsert(&renamed)?;
        assert_eq!(storage.get(vault.id())?.name, "Renamed");
        assert_eq!(storage.list()?.len(), 1);

        assert!(storage.delete_vault(vault.id())?);
        assert!(!storage.delete_vault(vault.id())?);
        Ok(())
    }

    #[test]
    fn test_missing_vault() -> KeysignResult<()> {
        let storage = Storage::open_memory()?;
        assert!(matches!(
            storage.get("nope"),
            Err(KeysignError::VaultNotFound(id)) if id == "nope"
        ));
        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> KeysignResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("vaults.redb");
        let vault = sample_vault("a", &["a", "b"]);

        {
            let storage = Storage::open(&path)?;
            storage.upsert(&vault)?;
        }

        let storage = Storage::open(&path)?;
        assert_eq!(storage.get(vault.id())?, vault);
        Ok(())
    }
}
