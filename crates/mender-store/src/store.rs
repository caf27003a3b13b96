use async_trait::async_trait;

use crate::error::StoreError;

/// Well-known blob names persisted by the agent. Kept as constants rather
/// than an enum so the store itself stays agnostic of what the bytes mean.
pub mod keys {
    pub const ARTIFACT_NAME: &str = "artifact_name";
    pub const PRIVATE_KEY: &str = "private_key";
    pub const PUBLIC_KEY: &str = "public_key";
    pub const DEPLOYMENT_DATA: &str = "deployment_data";
    pub const PROVIDES: &str = "provides";
}

/// The persistent storage collaborator (§6): an opaque byte blob keyed by
/// name. The agent never assumes anything about the backing medium beyond
/// "writes that return Ok are durable before the next read."
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Convenience helpers layered on [`StateStore`] for JSON-shaped blobs.
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes).await
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}
