use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::StateStore;

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Persistent state store backed by a redb database file.
///
/// Every blob written survives process restarts; redb's write-transaction
/// commit gives us the atomic replace the agent needs across a deployment
/// (§4.5: persist after every major state transition).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Internal(e.to_string()))?;

        {
            let wtxn = db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.open_table(BLOBS).map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl StateStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.db.begin_read().map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn.open_table(BLOBS).map_err(|e| StoreError::Internal(e.to_string()))?;
        match table.get(key).map_err(|e| StoreError::Internal(e.to_string()))? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table = wtxn.open_table(BLOBS).map_err(|e| StoreError::Internal(e.to_string()))?;
            table.insert(key, value).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table = wtxn.open_table(BLOBS).map_err(|e| StoreError::Internal(e.to_string()))?;
            table.remove(key).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("state.redb")).unwrap()
    }

    #[tokio::test]
    async fn set_and_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set("artifact_name", b"release-1").await.unwrap();
        let got = store.get("artifact_name").await.unwrap();
        assert_eq!(got, Some(b"release-1".to_vec()));
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.set("artifact_name", b"persistent").await.unwrap();
        }

        {
            let store = RedbStore::open(&path).unwrap();
            let got = store.get("artifact_name").await.unwrap();
            assert_eq!(got, Some(b"persistent".to_vec()));
        }
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.set("k", b"v").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
