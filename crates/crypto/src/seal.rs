//! Envelope sealing and verification.
//!
//! Sealing: hash the canonical unsigned body, sign the hash. Verification
//! recomputes both and additionally checks that the sender's agent id is
//! the hash of its public key and that the verb was published under its
//! registered capability. Lamport monotonicity is receiver state and is
//! enforced by the ingestion pipeline, not here.

use crate::error::CryptoError;
use crate::hash::content_hash;
use crate::sign::{verify_detached, Ed25519Keypair};
use agora_types::error::ProtocolError;
use agora_types::{AgentId, Envelope, UnsignedEnvelope};

/// Derives the stable agent identity from raw public key bytes.
pub fn agent_id_from_pubkey(pubkey: &[u8]) -> Result<AgentId, CryptoError> {
    Ok(AgentId(crate::hash::sha256(pubkey)?))
}

/// A node's signing identity.
pub struct Signer {
    keypair: Ed25519Keypair,
    agent_id: AgentId,
}

impl Signer {
    pub fn new(keypair: Ed25519Keypair) -> Result<Self, CryptoError> {
        let agent_id = agent_id_from_pubkey(&keypair.public_bytes())?;
        Ok(Self { keypair, agent_id })
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.keypair.public_bytes()
    }

    /// Seals an unsigned body: computes the id over the canonical preimage
    /// and signs it. The sender fields must already name this identity.
    pub fn seal(&self, unsigned: UnsignedEnvelope) -> Result<Envelope, ProtocolError> {
        if unsigned.sender.agent_id != self.agent_id {
            return Err(ProtocolError::SenderKeyMismatch(unsigned.sender.agent_id));
        }
        let preimage = unsigned
            .signing_preimage()
            .map_err(ProtocolError::Codec)?;
        let id = content_hash(&preimage).map_err(ProtocolError::Crypto)?;
        let sig = self.keypair.sign(&id.0).map_err(ProtocolError::Crypto)?;
        Ok(unsigned.into_envelope(id, sig))
    }
}

/// Full authenticity check for a received envelope.
pub fn verify_envelope(env: &Envelope) -> Result<(), ProtocolError> {
    // 1. Id must be the hash of the canonical unsigned body.
    let preimage = env
        .unsigned()
        .signing_preimage()
        .map_err(ProtocolError::Codec)?;
    let expected = content_hash(&preimage).map_err(ProtocolError::Crypto)?;
    if expected != env.id {
        return Err(ProtocolError::IdMismatch {
            expected,
            got: env.id,
        });
    }

    // 2. Agent id must derive from the presented key.
    let derived = agent_id_from_pubkey(&env.sender.pubkey).map_err(ProtocolError::Crypto)?;
    if derived != env.sender.agent_id {
        return Err(ProtocolError::SenderKeyMismatch(env.sender.agent_id));
    }

    // 3. The verb must ride under its registered capability.
    let required = env.verb.capability();
    if required != env.capability {
        return Err(ProtocolError::CapabilityMismatch {
            expected: required,
            got: env.capability,
        });
    }

    // 4. Signature over the id.
    verify_detached(&env.sender.pubkey, &env.id.0, &env.sig).map_err(|e| match e {
        CryptoError::InvalidSignature => ProtocolError::BadSignature,
        other => ProtocolError::Crypto(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::{Capability, ContentHash, NeedId, Sender, ThreadId, Verb};

    fn unsigned_for(signer: &Signer, lamport: u64) -> UnsignedEnvelope {
        UnsignedEnvelope {
            thread: ThreadId([1; 32]),
            sender: Sender {
                pubkey: signer.public_bytes(),
                agent_id: signer.agent_id(),
            },
            capability: Capability::Planning,
            verb: Verb::Need {
                need: NeedId([2; 32]),
                epoch: 1,
                budget: 50,
                task_type: "index".into(),
            },
            content_refs: vec![],
            policy_capsule_hash: ContentHash([3; 32]),
            policy_engine_hash: ContentHash([4; 32]),
            policy_eval_digest: None,
            lamport,
            timestamp: 1,
        }
    }

    #[test]
    fn sealed_envelope_verifies() {
        let signer = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let env = signer.seal(unsigned_for(&signer, 1)).unwrap();
        verify_envelope(&env).unwrap();
    }

    #[test]
    fn mutated_body_fails_id_check() {
        let signer = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let mut env = signer.seal(unsigned_for(&signer, 1)).unwrap();
        env.lamport += 1;
        assert!(matches!(
            verify_envelope(&env),
            Err(ProtocolError::IdMismatch { .. })
        ));
    }

    #[test]
    fn forged_sender_identity_is_caught() {
        let signer = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let mut unsigned = unsigned_for(&signer, 1);
        unsigned.sender.agent_id = AgentId([0xEE; 32]);
        assert!(signer.seal(unsigned).is_err());
    }

    #[test]
    fn wrong_capability_is_rejected() {
        let signer = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let mut unsigned = unsigned_for(&signer, 1);
        unsigned.capability = Capability::Results;
        let env = signer.seal(unsigned).unwrap();
        assert!(matches!(
            verify_envelope(&env),
            Err(ProtocolError::CapabilityMismatch { .. })
        ));
    }

    #[test]
    fn signature_from_another_key_fails() {
        let signer = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let intruder = Signer::new(Ed25519Keypair::generate().unwrap()).unwrap();
        let env = signer.seal(unsigned_for(&signer, 1)).unwrap();
        let mut forged = env.clone();
        forged.sig = intruder.keypair_sig(&env.id.0);
        assert!(matches!(
            verify_envelope(&forged),
            Err(ProtocolError::BadSignature)
        ));
    }

    impl Signer {
        fn keypair_sig(&self, msg: &[u8]) -> Vec<u8> {
            self.keypair.sign(msg).unwrap()
        }
    }
}
