//! Declared agent capability manifests.
//!
//! Routing matches on what an agent declares, never on runtime probing: an
//! agent that cannot honor its declared schemas loses reputation and stake
//! through the normal challenge flow instead.

use crate::primitives::AgentId;
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// What an agent claims it can do, and on what terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct CapabilityDescriptor {
    /// Schema id of accepted inputs.
    pub schema_in: String,
    /// Schema id of produced outputs.
    pub schema_out: String,
    /// Free-form routing tags ("translate", "rust", "citations").
    pub tags: Vec<String>,
    /// Asking price in credits per task.
    pub price: u64,
    /// Ed25519 public key bytes of the offering agent.
    pub pubkey: Vec<u8>,
    /// Manifest version string.
    pub version: String,
}

/// A routable candidate: the manifest plus the operational profile the
/// selection pipeline scores and constrains on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub agent_id: AgentId,
    pub capability: CapabilityDescriptor,
    /// Declared operating organization, for diversity caps.
    pub org: String,
    /// Autonomous system the agent publishes from.
    pub asn: u32,
    /// Coarse geographic region label.
    pub region: String,
    /// Identity-graph cluster id; sybil sets collapse into one cluster.
    pub identity_cluster: u64,
    pub reputation: f64,
    pub p95_latency_ms: u64,
    pub stake: u64,
    /// Router-maintained per-domain fit estimate in `[0, 1]`.
    pub domain_fit: f64,
    /// Last epoch this agent produced or verified anything.
    pub last_active_epoch: u64,
}
