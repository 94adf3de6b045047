//! Binary Merkle tree over canonical leaves.
//!
//! Leaf and internal hashes are domain-separated; an odd node is promoted
//! to the next level unchanged. Proofs for pruned facts keep the log
//! auditable after hot storage drops them.

use agora_types::error::CryptoError;
use agora_types::ContentHash;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(bytes: &[u8]) -> Result<ContentHash, CryptoError> {
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.push(LEAF_PREFIX);
    buf.extend_from_slice(bytes);
    agora_crypto::content_hash(&buf)
}

fn node_hash(left: &ContentHash, right: &ContentHash) -> Result<ContentHash, CryptoError> {
    let mut buf = Vec::with_capacity(65);
    buf.push(NODE_PREFIX);
    buf.extend_from_slice(&left.0);
    buf.extend_from_slice(&right.0);
    agora_crypto::content_hash(&buf)
}

/// One sibling step in an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: ContentHash,
    /// True when the sibling sits to the left of the running hash.
    pub sibling_is_left: bool,
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub path: Vec<ProofStep>,
}

/// Root over `leaves`. The empty tree hashes the empty string as a leaf so
/// it still has a well-defined, distinct root.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Result<ContentHash, CryptoError> {
    if leaves.is_empty() {
        return leaf_hash(&[]);
    }
    let mut level: Vec<ContentHash> = leaves
        .iter()
        .map(|l| leaf_hash(l))
        .collect::<Result<_, _>>()?;
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut iter = level.chunks(2);
        for pair in &mut iter {
            match pair {
                [left, right] => next.push(node_hash(left, right)?),
                [odd] => next.push(*odd),
                _ => {}
            }
        }
        level = next;
    }
    Ok(level.first().copied().unwrap_or(ContentHash([0; 32])))
}

/// Inclusion proof for `leaves[index]`.
pub fn merkle_proof(leaves: &[Vec<u8>], index: usize) -> Result<MerkleProof, CryptoError> {
    if index >= leaves.len() {
        return Err(CryptoError::InvalidInput(format!(
            "proof index {} out of range {}",
            index,
            leaves.len()
        )));
    }
    let mut level: Vec<ContentHash> = leaves
        .iter()
        .map(|l| leaf_hash(l))
        .collect::<Result<_, _>>()?;
    let mut idx = index;
    let mut path = Vec::new();
    while level.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        if let Some(sibling) = level.get(sibling_idx) {
            path.push(ProofStep {
                sibling: *sibling,
                sibling_is_left: sibling_idx < idx,
            });
        }
        // Odd tail promotes; no path step for it.
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut iter = level.chunks(2);
        for pair in &mut iter {
            match pair {
                [left, right] => next.push(node_hash(left, right)?),
                [odd] => next.push(*odd),
                _ => {}
            }
        }
        idx /= 2;
        level = next;
    }
    Ok(MerkleProof {
        leaf_index: index as u64,
        path,
    })
}

/// Verifies that `leaf_bytes` sits under `root` via `proof`.
pub fn verify_proof(
    root: &ContentHash,
    leaf_bytes: &[u8],
    proof: &MerkleProof,
) -> Result<bool, CryptoError> {
    let mut running = leaf_hash(leaf_bytes)?;
    for step in &proof.path {
        running = if step.sibling_is_left {
            node_hash(&step.sibling, &running)?
        } else {
            node_hash(&running, &step.sibling)?
        };
    }
    Ok(running == *root)
}
