//! In-memory artifact store.

use agora_api::{ArtifactStore, CasError};
use agora_types::ContentHash;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A process-local artifact store. Cloning shares the underlying map, so a
/// single-process cluster can hand one store to every node.
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<ContentHash, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentHash, CasError> {
        let h = agora_crypto::content_hash(bytes).map_err(|e| CasError::Backend(e.to_string()))?;
        self.inner.write().entry(h).or_insert_with(|| bytes.to_vec());
        Ok(h)
    }

    async fn get(&self, h: &ContentHash) -> Result<Vec<u8>, CasError> {
        self.inner
            .read()
            .get(h)
            .cloned()
            .ok_or(CasError::NotFound(*h))
    }

    async fn has(&self, h: &ContentHash) -> Result<bool, CasError> {
        Ok(self.inner.read().contains_key(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_has() {
        let store = MemoryStore::new();
        let h = store.put(b"artifact bytes").await.unwrap();
        assert!(store.has(&h).await.unwrap());
        assert_eq!(store.get(&h).await.unwrap(), b"artifact bytes");
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = MemoryStore::new();
        let h1 = store.put(b"same").await.unwrap();
        let h2 = store.put(b"same").await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let store = MemoryStore::new();
        let h = ContentHash([9; 32]);
        assert!(matches!(
            store.get(&h).await,
            Err(CasError::NotFound(missing)) if missing == h
        ));
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let store = MemoryStore::new();
        let other = store.clone();
        let h = store.put(b"shared").await.unwrap();
        assert!(other.has(&h).await.unwrap());
    }
}
