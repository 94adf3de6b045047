//! Evaluation inputs.
//!
//! Everything the evaluator may look at is collected here and canonically
//! encoded into the decision digest. Nothing outside this struct can
//! influence a verdict; that is what makes cross-node digest comparison
//! meaningful.

use crate::gates::Gate;
use agora_types::{AgentId, Capability, VerbKind};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The full input set for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct EvalInputs {
    pub gate: Gate,
    pub verb: VerbKind,
    pub capability: Capability,
    pub sender: AgentId,
    /// Routing tags attached to the message or task.
    pub tags: Vec<String>,
    /// Credits this message moves or escrows.
    pub credits: u64,
    /// Total bytes of referenced payload artifacts.
    pub payload_bytes: u64,
    /// Messages already sent in this thread (budget telemetry).
    pub msgs_in_thread: u64,
    /// Wall-clock elapsed against the ttl budget, milliseconds. Zero at
    /// preflight/ingress; populated from telemetry at the commit gate.
    pub elapsed_ms: u64,
    /// Retries already attempted for this operation.
    pub retries: u32,
}

impl EvalInputs {
    /// A baseline input set for `verb` from `sender` at `gate`, with all
    /// telemetry zeroed. Call sites fill in what they know.
    pub fn for_verb(gate: Gate, verb: VerbKind, capability: Capability, sender: AgentId) -> Self {
        Self {
            gate,
            verb,
            capability,
            sender,
            tags: Vec::new(),
            credits: 0,
            payload_bytes: 0,
            msgs_in_thread: 0,
            elapsed_ms: 0,
            retries: 0,
        }
    }
}
