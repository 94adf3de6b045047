//! Signed envelopes: the only thing that travels on the bus.
//!
//! An envelope is immutable once sealed. Its `id` is the kernel hash of the
//! canonical encoding of everything except `id` and `sig`; the signature
//! covers the `id`. Receivers recompute both before anything else happens.

use crate::primitives::{AgentId, ContentHash, ThreadId};
use crate::verb::Verb;
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Bus capability groups. A verb published under the wrong capability is a
/// protocol violation rejected during envelope verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Planning,
    Execution,
    Results,
}

/// Message originator: raw public key plus the derived agent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Sender {
    /// Ed25519 public key bytes.
    pub pubkey: Vec<u8>,
    /// Hash-derived identity; must match `pubkey` on verification.
    pub agent_id: AgentId,
}

/// The unsigned body of an envelope. Its canonical encoding is the signing
/// preimage, so field order here is consensus-critical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct UnsignedEnvelope {
    pub thread: ThreadId,
    pub sender: Sender,
    pub capability: Capability,
    pub verb: Verb,
    /// CAS references to bulk content; the envelope itself stays small.
    pub content_refs: Vec<ContentHash>,
    /// Hash of the policy capsule this message binds itself to.
    pub policy_capsule_hash: ContentHash,
    /// Hash identifying the exact evaluator the capsule targets.
    pub policy_engine_hash: ContentHash,
    /// Commit-gate evaluation digest, present on ATTEST messages.
    pub policy_eval_digest: Option<ContentHash>,
    pub lamport: u64,
    /// Sender wall clock, milliseconds. Advisory; never used for ordering.
    pub timestamp: u64,
}

/// A sealed, signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Envelope {
    /// Kernel hash of the canonical encoding of [`UnsignedEnvelope`].
    pub id: ContentHash,
    pub thread: ThreadId,
    pub sender: Sender,
    pub capability: Capability,
    pub verb: Verb,
    pub content_refs: Vec<ContentHash>,
    pub policy_capsule_hash: ContentHash,
    pub policy_engine_hash: ContentHash,
    pub policy_eval_digest: Option<ContentHash>,
    pub lamport: u64,
    pub timestamp: u64,
    /// Ed25519 signature over `id`.
    pub sig: Vec<u8>,
}

impl Envelope {
    /// Reconstructs the unsigned body whose canonical bytes were hashed to
    /// produce `id`. Verifiers re-encode this and compare.
    pub fn unsigned(&self) -> UnsignedEnvelope {
        UnsignedEnvelope {
            thread: self.thread,
            sender: self.sender.clone(),
            capability: self.capability,
            verb: self.verb.clone(),
            content_refs: self.content_refs.clone(),
            policy_capsule_hash: self.policy_capsule_hash,
            policy_engine_hash: self.policy_engine_hash,
            policy_eval_digest: self.policy_eval_digest,
            lamport: self.lamport,
            timestamp: self.timestamp,
        }
    }
}

impl UnsignedEnvelope {
    /// Canonical signing preimage.
    pub fn signing_preimage(&self) -> Result<Vec<u8>, String> {
        crate::codec::to_bytes_canonical(self)
    }

    /// Completes the envelope with a precomputed id and signature.
    pub fn into_envelope(self, id: ContentHash, sig: Vec<u8>) -> Envelope {
        Envelope {
            id,
            thread: self.thread,
            sender: self.sender,
            capability: self.capability,
            verb: self.verb,
            content_refs: self.content_refs,
            policy_capsule_hash: self.policy_capsule_hash,
            policy_engine_hash: self.policy_engine_hash,
            policy_eval_digest: self.policy_eval_digest,
            lamport: self.lamport,
            timestamp: self.timestamp,
            sig,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verb::Verb;
    use crate::NeedId;

    fn sample_unsigned() -> UnsignedEnvelope {
        UnsignedEnvelope {
            thread: ThreadId([7; 32]),
            sender: Sender {
                pubkey: vec![1, 2, 3],
                agent_id: AgentId([4; 32]),
            },
            capability: Capability::Planning,
            verb: Verb::Need {
                need: NeedId([5; 32]),
                epoch: 1,
                budget: 100,
                task_type: "translate".into(),
            },
            content_refs: vec![ContentHash([6; 32])],
            policy_capsule_hash: ContentHash([8; 32]),
            policy_engine_hash: ContentHash([9; 32]),
            policy_eval_digest: None,
            lamport: 11,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn preimage_is_stable_across_clones() {
        let u = sample_unsigned();
        assert_eq!(
            u.signing_preimage().unwrap(),
            u.clone().signing_preimage().unwrap()
        );
    }

    #[test]
    fn unsigned_roundtrips_through_envelope() {
        let u = sample_unsigned();
        let env = u.clone().into_envelope(ContentHash([1; 32]), vec![0; 64]);
        assert_eq!(env.unsigned(), u);
    }

    #[test]
    fn preimage_changes_with_any_field() {
        let base = sample_unsigned();
        let mut bumped = base.clone();
        bumped.lamport += 1;
        assert_ne!(
            base.signing_preimage().unwrap(),
            bumped.signing_preimage().unwrap()
        );
    }
}
