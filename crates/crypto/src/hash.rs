//! The kernel hash function.
//!
//! SHA-256 via `dcrypt`. All 32-byte ids in the system — envelope ids,
//! artifact references, checkpoint roots, policy digests — come from here.

use crate::error::CryptoError;
use agora_types::ContentHash;
use dcrypt::algorithms::hash::sha2::Sha256 as DcryptSha256;
use dcrypt::algorithms::hash::HashFunction as DcryptHashFunction;
use dcrypt::algorithms::ByteSerializable;

/// SHA-256 digest of `data` as a fixed 32-byte array.
pub fn sha256<T: AsRef<[u8]>>(data: T) -> Result<[u8; 32], CryptoError> {
    let digest = DcryptSha256::digest(data.as_ref())
        .map_err(|e| CryptoError::OperationFailed(format!("SHA-256 failed: {}", e)))?;
    let bytes = digest.to_bytes();
    let mut out = [0u8; 32];
    if bytes.len() != out.len() {
        return Err(CryptoError::OperationFailed(format!(
            "SHA-256 digest length {} != 32",
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// SHA-256 digest of `data` as a [`ContentHash`].
pub fn content_hash<T: AsRef<[u8]>>(data: T) -> Result<ContentHash, CryptoError> {
    sha256(data).map(ContentHash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        // SHA-256("abc")
        let h = sha256(b"abc").unwrap();
        assert_eq!(
            hex::encode(h),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(sha256(b"agora").unwrap(), sha256(b"agora").unwrap());
        assert_ne!(sha256(b"agora").unwrap(), sha256(b"arena").unwrap());
    }
}
