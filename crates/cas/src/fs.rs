//! Filesystem artifact store.
//!
//! Layout: `<root>/<first-hex-byte>/<remaining-hex>`. Writes go to a
//! temporary file, are fsynced, then atomically renamed into place, so a
//! crash never leaves a partially written artifact under its final name.

use agora_api::{ArtifactStore, CasError};
use agora_types::ContentHash;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self, CasError> {
        tokio::fs::create_dir_all(root.join("tmp"))
            .await
            .map_err(|e| CasError::Backend(format!("create store root: {}", e)))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, h: &ContentHash) -> PathBuf {
        let encoded = hex::encode(h.0);
        // Shard on the first byte to keep directories small.
        let (shard, rest) = encoded.split_at(2);
        self.root.join(shard).join(rest)
    }
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentHash, CasError> {
        let h = agora_crypto::content_hash(bytes).map_err(|e| CasError::Backend(e.to_string()))?;
        let final_path = self.path_for(&h);
        if tokio::fs::try_exists(&final_path)
            .await
            .map_err(|e| CasError::Backend(e.to_string()))?
        {
            return Ok(h);
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CasError::Backend(format!("create shard dir: {}", e)))?;
        }

        let tmp_path = self.root.join("tmp").join(format!("{}.part", h));
        let mut tmp = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CasError::Backend(format!("create tmp: {}", e)))?;
        tmp.write_all(bytes)
            .await
            .map_err(|e| CasError::Backend(format!("write tmp: {}", e)))?;
        tmp.sync_all()
            .await
            .map_err(|e| CasError::Backend(format!("fsync tmp: {}", e)))?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| CasError::Backend(format!("rename into place: {}", e)))?;
        debug!(target: "cas", artifact = %h, len = bytes.len(), "stored artifact");
        Ok(h)
    }

    async fn get(&self, h: &ContentHash) -> Result<Vec<u8>, CasError> {
        let path = self.path_for(h);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(*h))
            }
            Err(e) => return Err(CasError::Backend(e.to_string())),
        };
        let actual =
            agora_crypto::content_hash(&bytes).map_err(|e| CasError::Backend(e.to_string()))?;
        if actual != *h {
            return Err(CasError::Corrupt(*h));
        }
        Ok(bytes)
    }

    async fn has(&self, h: &ContentHash) -> Result<bool, CasError> {
        tokio::fs::try_exists(self.path_for(h))
            .await
            .map_err(|e| CasError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let h = store.put(b"persisted artifact").await.unwrap();
        assert!(store.has(&h).await.unwrap());
        assert_eq!(store.get(&h).await.unwrap(), b"persisted artifact");
    }

    #[tokio::test]
    async fn corruption_is_detected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let h = store.put(b"pristine").await.unwrap();

        // Flip a byte behind the store's back.
        let path = store.path_for(&h);
        tokio::fs::write(&path, b"tainted!").await.unwrap();

        assert!(matches!(store.get(&h).await, Err(CasError::Corrupt(_))));
    }

    #[tokio::test]
    async fn reopen_sees_existing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let h = {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.put(b"durable").await.unwrap()
        };
        let reopened = FsStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get(&h).await.unwrap(), b"durable");
    }
}
