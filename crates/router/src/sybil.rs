//! Identity admission.
//!
//! A DID enters the candidate roster only with skin in the game: either a
//! stake bond at or above the admission minimum, or a proof-of-work nonce
//! bound to the identity itself. Either way, manufacturing identities in
//! bulk costs something.

use crate::RouterError;
use agora_types::AgentId;
use serde::{Deserialize, Serialize};

/// What a joining identity presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionProof {
    /// Stake already bonded in the ledger, attested by the caller.
    Stake { bonded: u64 },
    /// A nonce such that `sha256(agent_id ‖ nonce)` clears the difficulty.
    Work { nonce: u64 },
}

/// Admission thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionPolicy {
    pub min_stake: u64,
    /// Required leading zero bits on the work hash.
    pub pow_difficulty_bits: u32,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            min_stake: 100,
            pow_difficulty_bits: 20,
        }
    }
}

impl AdmissionPolicy {
    /// Verifies an admission proof for `agent`.
    pub fn admit(&self, agent: &AgentId, proof: &AdmissionProof) -> Result<(), RouterError> {
        match proof {
            AdmissionProof::Stake { bonded } => {
                if *bonded < self.min_stake {
                    return Err(RouterError::AdmissionRefused(format!(
                        "stake {} below minimum {}",
                        bonded, self.min_stake
                    )));
                }
                Ok(())
            }
            AdmissionProof::Work { nonce } => {
                let mut preimage = Vec::with_capacity(40);
                preimage.extend_from_slice(&agent.0);
                preimage.extend_from_slice(&nonce.to_le_bytes());
                let digest = agora_crypto::sha256(&preimage)
                    .map_err(|e| RouterError::AdmissionRefused(e.to_string()))?;
                if leading_zero_bits(&digest) < self.pow_difficulty_bits {
                    return Err(RouterError::AdmissionRefused(
                        "work does not meet difficulty".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_below_minimum_is_refused() {
        let policy = AdmissionPolicy::default();
        let agent = AgentId([1; 32]);
        assert!(policy
            .admit(&agent, &AdmissionProof::Stake { bonded: 99 })
            .is_err());
        assert!(policy
            .admit(&agent, &AdmissionProof::Stake { bonded: 100 })
            .is_ok());
    }

    #[test]
    fn work_proof_must_clear_the_difficulty() {
        // Low difficulty so the test can actually mine.
        let policy = AdmissionPolicy {
            min_stake: 100,
            pow_difficulty_bits: 8,
        };
        let agent = AgentId([2; 32]);
        let nonce = (0u64..500_000)
            .find(|n| policy.admit(&agent, &AdmissionProof::Work { nonce: *n }).is_ok())
            .expect("a nonce under difficulty 8 exists in range");
        // A neighboring nonce almost surely fails.
        let miss = (0u64..500_000)
            .find(|n| policy.admit(&agent, &AdmissionProof::Work { nonce: *n }).is_err())
            .unwrap();
        assert_ne!(nonce, miss);
    }

    #[test]
    fn leading_zero_count_is_exact() {
        let mut digest = [0u8; 32];
        digest[0] = 0b0000_1000;
        assert_eq!(leading_zero_bits(&digest), 4);
        let all_zero = [0u8; 32];
        assert_eq!(leading_zero_bits(&all_zero), 256);
    }
}
