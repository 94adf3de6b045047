//! The three enforcement gates.
//!
//! Every externally invocable verb passes policy at preflight (sender),
//! ingress (every receiver), and — for commits — again at the commit gate
//! with post-hoc telemetry. The gatekeeper also tracks quarantined
//! capsules: once verifiers disagree on a digest, nothing governed by that
//! capsule advances.

use crate::capsule::PolicyCapsule;
use crate::engine::{Decision, Evaluator};
use crate::inputs::EvalInputs;
use agora_types::error::PolicyError;
use agora_types::ContentHash;
use parity_scale_codec::{Decode, Encode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// Where an evaluation is happening. Part of the digest inputs, so the
/// same message evaluated at different gates yields distinct digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Preflight,
    Ingress,
    CommitGate,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Ingress => "ingress",
            Self::CommitGate => "commit_gate",
        }
    }
}

/// Runs capsule evaluations at the gates and tracks quarantine state.
#[derive(Default)]
pub struct GateKeeper {
    evaluator: Evaluator,
    quarantined: RwLock<HashSet<ContentHash>>,
}

impl GateKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates and maps a deny to a typed error. The decision (and its
    /// digest) is returned on allow so commit-gate callers can attach it to
    /// their attestation.
    pub fn check(
        &self,
        capsule: &PolicyCapsule,
        capsule_hash: &ContentHash,
        inputs: &EvalInputs,
        gas_limit: u64,
    ) -> Result<Decision, PolicyError> {
        if self.quarantined.read().contains(capsule_hash) {
            return Err(PolicyError::Quarantined(*capsule_hash));
        }
        let decision = self.evaluator.eval(capsule, inputs, gas_limit)?;
        if decision.allow {
            return Ok(decision);
        }
        if decision.reasons.iter().any(|r| r == "gas_exhausted") {
            return Err(PolicyError::GasExhausted);
        }
        if decision.reasons.iter().any(|r| r.starts_with("budget_")) {
            return Err(PolicyError::BudgetExceeded(decision.reasons.join(",")));
        }
        Err(PolicyError::Denied {
            reasons: decision.reasons,
        })
    }

    /// Quarantines a capsule after a digest divergence. Idempotent.
    pub fn quarantine(&self, capsule_hash: ContentHash) {
        let inserted = self.quarantined.write().insert(capsule_hash);
        if inserted {
            warn!(target: "policy", capsule = %capsule_hash, "capsule quarantined after digest divergence");
        }
    }

    pub fn is_quarantined(&self, capsule_hash: &ContentHash) -> bool {
        self.quarantined.read().contains(capsule_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::{Budgets, ChallengeSplit};
    use crate::engine::engine_hash;
    use crate::program::DefaultVerdict;
    use agora_types::{AgentId, Capability, VerbKind};

    fn capsule() -> PolicyCapsule {
        PolicyCapsule {
            engine_hash: engine_hash(),
            schema_version: 1,
            rules: vec![],
            default_verdict: DefaultVerdict::AllowAll,
            budgets: Budgets {
                tokens: 1,
                credits: 1,
                msgs: 1,
                ttl_ms: 1,
            },
            challenge_split: ChallengeSplit::default(),
            retry_budget: 0,
            conformance_vector: None,
            gas_limit: 1_000,
        }
    }

    fn inputs(gate: Gate) -> EvalInputs {
        EvalInputs::for_verb(gate, VerbKind::Commit, Capability::Execution, AgentId([1; 32]))
    }

    #[test]
    fn allow_returns_the_decision() {
        let gk = GateKeeper::new();
        let c = capsule();
        let h = c.hash().unwrap();
        let d = gk.check(&c, &h, &inputs(Gate::Preflight), 1_000).unwrap();
        assert!(d.allow);
    }

    #[test]
    fn quarantined_capsule_refuses_evaluation() {
        let gk = GateKeeper::new();
        let c = capsule();
        let h = c.hash().unwrap();
        gk.quarantine(h);
        assert!(matches!(
            gk.check(&c, &h, &inputs(Gate::Ingress), 1_000),
            Err(PolicyError::Quarantined(q)) if q == h
        ));
    }

    #[test]
    fn budget_breach_maps_to_budget_error() {
        let gk = GateKeeper::new();
        let c = capsule();
        let h = c.hash().unwrap();
        let mut i = inputs(Gate::CommitGate);
        i.elapsed_ms = 5_000;
        assert!(matches!(
            gk.check(&c, &h, &i, 1_000),
            Err(PolicyError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn gate_is_part_of_the_digest() {
        let gk = GateKeeper::new();
        let c = capsule();
        let h = c.hash().unwrap();
        let pre = gk.check(&c, &h, &inputs(Gate::Preflight), 1_000).unwrap();
        let ing = gk.check(&c, &h, &inputs(Gate::Ingress), 1_000).unwrap();
        assert_ne!(pre.digest, ing.digest);
    }
}
