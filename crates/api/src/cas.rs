//! The content-addressed artifact store seam.

use agora_types::ContentHash;
use async_trait::async_trait;

/// Errors surfaced by an artifact store backend.
#[derive(thiserror::Error, Debug)]
pub enum CasError {
    /// No artifact exists under the requested hash.
    #[error("Artifact not found: {0}")]
    NotFound(ContentHash),
    /// The stored bytes no longer hash to their key.
    #[error("Artifact corrupt: {0}")]
    Corrupt(ContentHash),
    /// The backend failed.
    #[error("CAS backend error: {0}")]
    Backend(String),
}

/// A store of immutable artifacts addressed by their kernel hash.
///
/// Writes are additive only. A failed `get` blocks only the caller; log
/// appends never wait on artifact availability.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` and returns their content hash. Idempotent.
    async fn put(&self, bytes: &[u8]) -> Result<ContentHash, CasError>;

    /// Fetches the artifact stored under `h`, re-verifying its digest.
    async fn get(&self, h: &ContentHash) -> Result<Vec<u8>, CasError>;

    /// Whether an artifact is present under `h`.
    async fn has(&self, h: &ContentHash) -> Result<bool, CasError>;
}
