//! Encrypted at-rest storage for the node seed.
//!
//! Layout: an 8-byte magic, a length-prefixed canonical (SCALE) header,
//! then the AEAD ciphertext. The header carries the KDF work profile,
//! salt, and nonce — and the *entire* encoded header is folded into the
//! key derivation context, so a file whose header has been altered in any
//! byte derives a different wrapping key and fails authentication before
//! any field is even interpreted.
//!
//! The loader additionally refuses headers whose work profile differs
//! from the one this build derives with: a claim the backend cannot honor
//! is an error, never a silent fallback.

use crate::error::CryptoError;
use agora_types::codec;
use dcrypt::algorithms::aead::chacha20poly1305::ChaCha20Poly1305;
use dcrypt::algorithms::kdf::{Argon2, KdfOperation, KeyDerivationFunction};
use dcrypt::algorithms::types::Nonce;
use dcrypt::api::traits::symmetric::{DecryptOperation, EncryptOperation, SymmetricCipher};
use parity_scale_codec::{Decode, Encode};
use rand::{rngs::OsRng, RngCore};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_FILE_MAGIC: &[u8; 8] = b"AGORAKEY";
const KEY_FILE_VERSION: u16 = 1;
/// Domain-separation prefix for the wrapping-key derivation context.
const WRAP_INFO: &[u8] = b"agora-seed-wrap/v1";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEK_LEN: usize = 32;

/// Argon2id work profile recorded in (and bound through) the header.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u8,
}

impl KdfParams {
    /// The profile this build wraps and unwraps with.
    pub fn baseline() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            lanes: 4,
        }
    }
}

/// The canonical header preceding the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct KeyFileHeader {
    version: u16,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

/// Seed bytes that zeroize on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(pub Vec<u8>);

/// Derives the wrapping key. The encoded header rides in the derivation
/// context, which is what binds salt, nonce, version, and work profile to
/// the ciphertext.
fn derive_wrap_key(passphrase: &str, header_bytes: &[u8]) -> Result<[u8; KEK_LEN], CryptoError> {
    let header: KeyFileHeader = codec::from_bytes_canonical(header_bytes)
        .map_err(|e| CryptoError::InvalidInput(format!("malformed key file header: {}", e)))?;
    let mut info = Vec::with_capacity(WRAP_INFO.len() + header_bytes.len());
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(header_bytes);

    let kdf = Argon2::<SALT_LEN>::new();
    kdf.builder()
        .with_ikm(passphrase.as_bytes())
        .with_salt(&header.salt)
        .with_info(&info)
        .with_output_length(KEK_LEN)
        .derive_array()
        .map_err(|e| CryptoError::OperationFailed(format!("Argon2 derivation failed: {}", e)))
}

/// Wraps seed bytes under a passphrase, producing the key file blob.
pub fn wrap_seed(seed: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let header = KeyFileHeader {
        version: KEY_FILE_VERSION,
        kdf: KdfParams::baseline(),
        salt,
        nonce: nonce_bytes,
    };
    let header_bytes =
        codec::to_bytes_canonical(&header).map_err(CryptoError::OperationFailed)?;
    let header_len = u16::try_from(header_bytes.len())
        .map_err(|_| CryptoError::OperationFailed("key file header too large".into()))?;

    let kek = derive_wrap_key(passphrase, &header_bytes)?;
    let cipher = ChaCha20Poly1305::new(&kek);
    let nonce = Nonce::new(nonce_bytes);
    let ciphertext = SymmetricCipher::encrypt(&cipher)
        .with_nonce(&nonce)
        .encrypt(seed)
        .map_err(|e| CryptoError::OperationFailed(format!("seed encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(8 + 2 + header_bytes.len() + ciphertext.as_ref().len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&header_len.to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(ciphertext.as_ref());
    Ok(out)
}

/// Unwraps a key file blob back into seed bytes.
pub fn unwrap_seed(data: &[u8], passphrase: &str) -> Result<SecretBytes, CryptoError> {
    let magic = data.get(0..8).ok_or_else(truncated)?;
    if magic != KEY_FILE_MAGIC {
        return Err(CryptoError::InvalidInput("not an agora key file".into()));
    }
    let len_bytes: [u8; 2] = data
        .get(8..10)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(truncated)?;
    let header_len = usize::from(u16::from_be_bytes(len_bytes));
    let header_bytes = data.get(10..10 + header_len).ok_or_else(truncated)?;
    let ciphertext_bytes = data.get(10 + header_len..).ok_or_else(truncated)?;

    let header: KeyFileHeader = codec::from_bytes_canonical(header_bytes)
        .map_err(|e| CryptoError::InvalidInput(format!("malformed key file header: {}", e)))?;
    if header.version != KEY_FILE_VERSION {
        return Err(CryptoError::InvalidInput(format!(
            "unsupported key file version: {}",
            header.version
        )));
    }
    // The backend derives with one fixed work profile. A file claiming a
    // different profile cannot be honored, so it is refused outright.
    if header.kdf != KdfParams::baseline() {
        return Err(CryptoError::InvalidInput(format!(
            "key file demands an unsupported KDF profile ({} KiB, {} iters, {} lanes)",
            header.kdf.memory_kib, header.kdf.iterations, header.kdf.lanes
        )));
    }

    let kek = derive_wrap_key(passphrase, header_bytes)?;
    let cipher = ChaCha20Poly1305::new(&kek);
    let nonce = Nonce::new(header.nonce);
    let ciphertext = dcrypt::api::types::Ciphertext::new(ciphertext_bytes);
    let seed = SymmetricCipher::decrypt(&cipher)
        .with_nonce(&nonce)
        .decrypt(&ciphertext)
        .map_err(|_| {
            CryptoError::OperationFailed(
                "seed decryption failed (wrong passphrase or corrupted file)".into(),
            )
        })?;
    Ok(SecretBytes(seed))
}

fn truncated() -> CryptoError {
    CryptoError::InvalidInput("key file truncated".into())
}

/// Writes a wrapped seed to disk through a temp file and atomic rename.
pub fn save_key_file(path: &Path, seed: &[u8], passphrase: &str) -> Result<(), CryptoError> {
    let blob = wrap_seed(seed, passphrase)?;
    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&blob)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    write().map_err(|e| CryptoError::OperationFailed(format!("failed to write key file: {}", e)))
}

/// Loads and unwraps a seed from disk.
pub fn load_key_file(path: &Path, passphrase: &str) -> Result<SecretBytes, CryptoError> {
    let blob = std::fs::read(path)
        .map_err(|e| CryptoError::InvalidInput(format!("failed to read key file: {}", e)))?;
    unwrap_seed(&blob, passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::Ed25519Keypair;

    #[test]
    fn wrap_then_unwrap_recovers_the_seed() {
        let seed = b"thirty-two byte deterministic..!";
        let blob = wrap_seed(seed, "open sesame").unwrap();
        assert_eq!(&blob[0..8], KEY_FILE_MAGIC);
        assert_eq!(unwrap_seed(&blob, "open sesame").unwrap().0, seed);
    }

    #[test]
    fn wrong_passphrase_is_refused() {
        let blob = wrap_seed(b"seed", "right").unwrap();
        assert!(unwrap_seed(&blob, "wrong").is_err());
    }

    #[test]
    fn any_header_tamper_breaks_the_wrap() {
        let blob = wrap_seed(b"seed", "pw").unwrap();
        // Flip one byte in every header position in turn; each flip must
        // be rejected, whether it lands in the version, the work profile,
        // the salt, or the nonce — the derivation context covers them all.
        let header_len = u16::from_be_bytes([blob[8], blob[9]]) as usize;
        for i in 10..10 + header_len {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert!(
                unwrap_seed(&tampered, "pw").is_err(),
                "header byte {} accepted after tamper",
                i
            );
        }
    }

    #[test]
    fn foreign_work_profiles_are_refused_not_guessed() {
        // A header demanding more memory than the baseline profile is an
        // explicit error even though it decodes cleanly.
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        salt[0] = 1;
        nonce[0] = 2;
        let header = KeyFileHeader {
            version: KEY_FILE_VERSION,
            kdf: KdfParams {
                memory_kib: 256 * 1024,
                iterations: 8,
                lanes: 2,
            },
            salt,
            nonce,
        };
        let header_bytes = codec::to_bytes_canonical(&header).unwrap();
        let mut blob = Vec::new();
        blob.extend_from_slice(KEY_FILE_MAGIC);
        blob.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
        blob.extend_from_slice(&header_bytes);
        blob.extend_from_slice(&[0u8; 48]);

        let err = match unwrap_seed(&blob, "pw") {
            Ok(_) => panic!("expected unwrap_seed to fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("KDF profile"));
    }

    #[test]
    fn truncated_and_foreign_files_are_rejected() {
        assert!(unwrap_seed(b"short", "pw").is_err());
        let mut blob = wrap_seed(b"seed", "pw").unwrap();
        blob[0] ^= 0xFF;
        assert!(unwrap_seed(&blob, "pw").is_err());
        let cut = wrap_seed(b"seed", "pw").unwrap();
        assert!(unwrap_seed(&cut[..12], "pw").is_err());
    }

    #[test]
    fn file_roundtrip_restores_the_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let kp = Ed25519Keypair::generate().unwrap();
        save_key_file(&path, &kp.seed(), "pw").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let seed = load_key_file(&path, "pw").unwrap();
        let restored = Ed25519Keypair::from_seed(&seed.0).unwrap();
        assert_eq!(kp.public_bytes(), restored.public_bytes());
    }
}
