//! The policy capsule document.

use crate::program::{DefaultVerdict, PolicyRule};
use agora_types::error::PolicyError;
use agora_types::{codec, ContentHash};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Resource budgets bound into a capsule. Enforced at every gate; the
/// commit gate re-checks them against post-hoc telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Budgets {
    /// Model-token allowance for the governed work.
    pub tokens: u64,
    /// Credit allowance (spend + escrow) for the governed work.
    pub credits: u64,
    /// Message allowance per thread.
    pub msgs: u64,
    /// Wall-clock allowance; also the deadline for outbound operations.
    pub ttl_ms: u64,
}

/// How a forfeited sum is reallocated after an upheld challenge, in basis
/// points. Must sum to exactly 10 000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ChallengeSplit {
    pub challenger_bps: u16,
    pub honest_bps: u16,
    pub burn_bps: u16,
}

impl ChallengeSplit {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let sum = u32::from(self.challenger_bps)
            + u32::from(self.honest_bps)
            + u32::from(self.burn_bps);
        if sum != 10_000 {
            return Err(PolicyError::InvalidCapsule(format!(
                "challenge split sums to {} bps, expected 10000",
                sum
            )));
        }
        Ok(())
    }
}

impl Default for ChallengeSplit {
    fn default() -> Self {
        Self {
            challenger_bps: 5_000,
            honest_bps: 4_000,
            burn_bps: 1_000,
        }
    }
}

/// A signed policy document, referenced from every envelope by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PolicyCapsule {
    /// The evaluator build this capsule targets. A node whose evaluator
    /// hash differs must refuse to evaluate.
    pub engine_hash: ContentHash,
    pub schema_version: u32,
    /// The rule program, first match wins.
    pub rules: Vec<PolicyRule>,
    pub default_verdict: DefaultVerdict,
    pub budgets: Budgets,
    /// Economic reallocation on upheld challenges.
    pub challenge_split: ChallengeSplit,
    /// Retry allowance enforced at preflight.
    pub retry_budget: u32,
    /// Optional expected-decision vector for cross-build conformance runs.
    pub conformance_vector: Option<Vec<u8>>,
    /// Gas ceiling for one evaluation of this capsule.
    pub gas_limit: u64,
}

impl PolicyCapsule {
    /// Canonical hash of the capsule; the value envelopes reference.
    pub fn hash(&self) -> Result<ContentHash, PolicyError> {
        let bytes = codec::to_bytes_canonical(self).map_err(PolicyError::InvalidCapsule)?;
        agora_crypto::content_hash(&bytes)
            .map_err(|e| PolicyError::InvalidCapsule(e.to_string()))
    }

    /// Structural validation, run once when a capsule is installed.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.challenge_split.validate()?;
        if self.gas_limit == 0 {
            return Err(PolicyError::InvalidCapsule("gas_limit is zero".into()));
        }
        if self.budgets.ttl_ms == 0 {
            return Err(PolicyError::InvalidCapsule("ttl budget is zero".into()));
        }
        Ok(())
    }
}
