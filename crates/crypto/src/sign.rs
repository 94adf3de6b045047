//! Ed25519 signing keys, backed by `dcrypt`.

use crate::error::CryptoError;
use dcrypt::api::Signature as _;
use dcrypt::sign::eddsa;
use rand::rngs::OsRng;

/// An Ed25519 keypair held in process memory.
#[derive(Clone)]
pub struct Ed25519Keypair {
    public_key: eddsa::Ed25519PublicKey,
    secret_key: eddsa::Ed25519SecretKey,
}

impl Ed25519Keypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let (public_key, secret_key) = eddsa::Ed25519::keypair(&mut rng)
            .map_err(|e| CryptoError::OperationFailed(format!("keypair generation failed: {}", e)))?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Rebuilds a keypair from a 32-byte seed (the persisted form).
    pub fn from_seed(seed_bytes: &[u8]) -> Result<Self, CryptoError> {
        if seed_bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(
                "Invalid seed length: expected 32 bytes".to_string(),
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(seed_bytes);
        let secret_key = eddsa::Ed25519SecretKey::from_seed(&seed)
            .map_err(|e| CryptoError::InvalidKey(format!("secret key from seed failed: {:?}", e)))?;
        let public_key = secret_key
            .public_key()
            .map_err(|e| CryptoError::InvalidKey(format!("public key derivation failed: {:?}", e)))?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    /// Raw public key bytes as they appear in envelope senders.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public_key.to_bytes().to_vec()
    }

    /// The 32-byte seed; only the key store should ever see this.
    pub fn seed(&self) -> Vec<u8> {
        self.secret_key.seed().to_vec()
    }

    /// Signs `message`, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sig = eddsa::Ed25519::sign(message, &self.secret_key)
            .map_err(|e| CryptoError::OperationFailed(format!("signing failed: {}", e)))?;
        Ok(sig.to_bytes().to_vec())
    }
}

/// Verifies a detached signature against raw public key bytes.
pub fn verify_detached(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), CryptoError> {
    let pk = eddsa::Ed25519PublicKey::from_bytes(public_key_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("public key parse failed: {:?}", e)))?;
    let sig = eddsa::Ed25519Signature::from_bytes(signature_bytes)
        .map_err(|_| CryptoError::InvalidSignature)?;
    eddsa::Ed25519::verify(message, &sig, &pk).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Ed25519Keypair::generate().unwrap();
        let sig = kp.sign(b"hello agora").unwrap();
        verify_detached(&kp.public_bytes(), b"hello agora", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let kp = Ed25519Keypair::generate().unwrap();
        let sig = kp.sign(b"original").unwrap();
        assert!(verify_detached(&kp.public_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn seed_rebuilds_identical_keypair() {
        let kp = Ed25519Keypair::generate().unwrap();
        let rebuilt = Ed25519Keypair::from_seed(&kp.seed()).unwrap();
        assert_eq!(kp.public_bytes(), rebuilt.public_bytes());
        let sig = rebuilt.sign(b"persisted").unwrap();
        verify_detached(&kp.public_bytes(), b"persisted", &sig).unwrap();
    }

    #[test]
    fn short_seed_is_rejected() {
        assert!(Ed25519Keypair::from_seed(&[0u8; 16]).is_err());
    }
}
