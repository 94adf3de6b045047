//! Canonical, deterministic binary codec for all consensus-critical data.
//!
//! Thin wrappers around `parity-scale-codec` (SCALE). Envelope ids, policy
//! digests, checkpoint roots, and every replicated fact are computed over
//! these bytes, so all components must share the exact same serialization.

use parity_scale_codec::{Decode, DecodeAll, Encode};

/// Encodes a value into its canonical byte representation.
///
/// Use this for all data that is hashed, signed, or replicated. The result
/// is deterministic for a given value.
pub fn to_bytes_canonical<T: Encode>(v: &T) -> Result<Vec<u8>, String> {
    Ok(v.encode())
}

/// Decodes a value from its canonical byte representation.
///
/// Fails fast on trailing bytes or malformed input so that no two nodes can
/// disagree about what a byte string means.
pub fn from_bytes_canonical<T: Decode>(b: &[u8]) -> Result<T, String> {
    T::decode_all(&mut &*b).map_err(|e| format!("canonical decode failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Encode, Decode, Debug, PartialEq, Eq)]
    struct Sample {
        seq: u64,
        tags: Vec<String>,
    }

    #[test]
    fn roundtrip_is_lossless() {
        let v = Sample {
            seq: 7,
            tags: vec!["plan".into(), "verify".into()],
        };
        let bytes = to_bytes_canonical(&v).unwrap();
        assert_eq!(from_bytes_canonical::<Sample>(&bytes).unwrap(), v);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let v = Sample {
            seq: 1,
            tags: vec![],
        };
        let mut bytes = to_bytes_canonical(&v).unwrap();
        bytes.push(0xFF);
        assert!(from_bytes_canonical::<Sample>(&bytes).is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let v = Sample {
            seq: 42,
            tags: vec!["x".into()],
        };
        let mut bytes = to_bytes_canonical(&v).unwrap();
        bytes.pop();
        let err = from_bytes_canonical::<Sample>(&bytes).unwrap_err();
        assert!(err.contains("canonical decode failed"));
    }
}
