//! Deterministic identities, capsules, and envelopes.

use agora_crypto::{Ed25519Keypair, Signer};
use agora_policy::{Budgets, DefaultVerdict, PolicyCapsule};
use agora_types::{ContentHash, Envelope, NeedId, Sender, ThreadId, UnsignedEnvelope, Verb};
use std::sync::atomic::{AtomicU64, Ordering};

/// A keypair derived from a one-byte seed; the same seed always yields the
/// same identity.
pub fn keypair(seed: u8) -> Ed25519Keypair {
    Ed25519Keypair::from_seed(&[seed; 32]).expect("fixture seed is 32 bytes")
}

/// A signer over [`keypair`].
pub fn signer(seed: u8) -> Signer {
    Signer::new(keypair(seed)).expect("fixture keypair is valid")
}

/// An allow-everything capsule with generous budgets, targeting the
/// current evaluator build.
pub fn permissive_capsule() -> PolicyCapsule {
    PolicyCapsule {
        engine_hash: agora_policy::engine_hash(),
        schema_version: 1,
        rules: vec![],
        default_verdict: DefaultVerdict::AllowAll,
        budgets: Budgets {
            tokens: u64::MAX / 2,
            credits: u64::MAX / 2,
            msgs: u64::MAX / 2,
            ttl_ms: u64::MAX / 2,
        },
        challenge_split: Default::default(),
        retry_budget: 100,
        conformance_vector: None,
        gas_limit: 100_000,
    }
}

/// Seals envelopes for one identity with monotonically increasing lamport
/// stamps.
pub struct EnvelopeFactory {
    signer: Signer,
    thread: ThreadId,
    capsule_hash: ContentHash,
    engine_hash: ContentHash,
    lamport: AtomicU64,
}

impl EnvelopeFactory {
    pub fn new(signer: Signer) -> Self {
        let capsule = permissive_capsule();
        Self {
            signer,
            thread: ThreadId([0xAA; 32]),
            capsule_hash: capsule.hash().expect("fixture capsule hashes"),
            engine_hash: capsule.engine_hash,
            lamport: AtomicU64::new(1),
        }
    }

    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.thread = thread;
        self
    }

    pub fn agent_id(&self) -> agora_types::AgentId {
        self.signer.agent_id()
    }

    /// Seals `verb` with the next lamport stamp.
    pub fn seal(&self, verb: Verb, content_refs: Vec<ContentHash>, timestamp: u64) -> Envelope {
        let capability = verb.capability();
        let unsigned = UnsignedEnvelope {
            thread: self.thread,
            sender: Sender {
                pubkey: self.signer.public_bytes(),
                agent_id: self.signer.agent_id(),
            },
            capability,
            verb,
            content_refs,
            policy_capsule_hash: self.capsule_hash,
            policy_engine_hash: self.engine_hash,
            policy_eval_digest: None,
            lamport: self.lamport.fetch_add(1, Ordering::SeqCst),
            timestamp,
        };
        self.signer.seal(unsigned).expect("fixture envelope seals")
    }

    /// Seals an envelope carrying a commit-gate digest (ATTEST shape).
    pub fn seal_with_digest(
        &self,
        verb: Verb,
        digest: ContentHash,
        timestamp: u64,
    ) -> Envelope {
        let capability = verb.capability();
        let unsigned = UnsignedEnvelope {
            thread: self.thread,
            sender: Sender {
                pubkey: self.signer.public_bytes(),
                agent_id: self.signer.agent_id(),
            },
            capability,
            verb,
            content_refs: vec![],
            policy_capsule_hash: self.capsule_hash,
            policy_engine_hash: self.engine_hash,
            policy_eval_digest: Some(digest),
            lamport: self.lamport.fetch_add(1, Ordering::SeqCst),
            timestamp,
        };
        self.signer.seal(unsigned).expect("fixture envelope seals")
    }

    /// A minimal valid envelope for transport tests.
    pub fn heartbeat_probe(&self) -> Envelope {
        self.seal(
            Verb::Heartbeat {
                need: NeedId([1; 32]),
                epoch: 1,
                fencing_token: 1,
            },
            vec![],
            0,
        )
    }

    pub fn capsule_hash(&self) -> ContentHash {
        self.capsule_hash
    }
}

/// Convenience: a factory's worth of distinct signers.
pub fn signers(seeds: std::ops::RangeInclusive<u8>) -> Vec<Signer> {
    seeds.map(signer).collect()
}
