//! The deterministic, gas-metered capsule evaluator.

use crate::capsule::PolicyCapsule;
use crate::inputs::EvalInputs;
use crate::program::{DefaultVerdict, PolicyRule, RuleVerdict};
use agora_types::error::PolicyError;
use agora_types::{codec, ContentHash};

/// Version tag of this evaluator build. Bump on any change to evaluation
/// semantics; capsules bind to the hash of this tag.
const ENGINE_VERSION_TAG: &[u8] = b"agora-policy-engine/v1";

/// Gas charged for visiting a rule, before its conditions.
const GAS_PER_RULE: u64 = 5;
/// Gas charged per evaluated condition.
const GAS_PER_CONDITION: u64 = 1;
/// Gas charged for the built-in budget checks.
const GAS_BUDGET_CHECKS: u64 = 4;

/// Hash identifying this evaluator build.
pub fn engine_hash() -> ContentHash {
    // The tag is a compile-time constant; hashing it cannot fail other than
    // by allocator exhaustion, which has no meaningful recovery here.
    agora_crypto::content_hash(ENGINE_VERSION_TAG).unwrap_or(ContentHash([0; 32]))
}

/// The outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    /// Stable reason strings, in evaluation order.
    pub reasons: Vec<String>,
    /// `sha256(canonical(inputs) || canonical(allow, reasons))`.
    pub digest: ContentHash,
    pub gas_used: u64,
}

/// The capsule evaluator. Stateless; the struct exists so call sites hold
/// one value carrying the build identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates `capsule` against `inputs` under `gas_limit`.
    ///
    /// Pure: the result is a function of the arguments alone. Gas
    /// exhaustion and engine mismatch are decisions (deny), not errors, so
    /// they too produce a comparable digest.
    pub fn eval(
        &self,
        capsule: &PolicyCapsule,
        inputs: &EvalInputs,
        gas_limit: u64,
    ) -> Result<Decision, PolicyError> {
        let budget = gas_limit.min(capsule.gas_limit);
        let mut gas_used: u64 = 0;
        let mut reasons = Vec::new();

        let allow = 'verdict: {
            // The capsule must target this evaluator build.
            if capsule.engine_hash != engine_hash() {
                reasons.push("engine_mismatch".to_string());
                break 'verdict false;
            }

            // Rule program: linear scan, first match wins.
            let mut matched: Option<RuleVerdict> = None;
            for (idx, rule) in capsule.rules.iter().enumerate() {
                gas_used += GAS_PER_RULE + GAS_PER_CONDITION * rule.conditions.check_count();
                if gas_used > budget {
                    reasons.push("gas_exhausted".to_string());
                    break 'verdict false;
                }
                if Self::rule_matches(rule, inputs) {
                    match rule.action {
                        RuleVerdict::Allow => matched = Some(RuleVerdict::Allow),
                        RuleVerdict::Deny => {
                            reasons.push(format!("rule_{}_deny", idx));
                            matched = Some(RuleVerdict::Deny);
                        }
                    }
                    break;
                }
            }

            match matched {
                Some(RuleVerdict::Deny) => break 'verdict false,
                Some(RuleVerdict::Allow) => {}
                None => match capsule.default_verdict {
                    DefaultVerdict::AllowAll => {}
                    DefaultVerdict::DenyAll => {
                        reasons.push("default_deny".to_string());
                        break 'verdict false;
                    }
                },
            }

            // Built-in budget enforcement, cheap and unconditional.
            gas_used += GAS_BUDGET_CHECKS;
            if gas_used > budget {
                reasons.push("gas_exhausted".to_string());
                break 'verdict false;
            }
            if inputs.credits > capsule.budgets.credits {
                reasons.push("budget_credits_exceeded".to_string());
                break 'verdict false;
            }
            if inputs.msgs_in_thread > capsule.budgets.msgs {
                reasons.push("budget_msgs_exceeded".to_string());
                break 'verdict false;
            }
            if inputs.elapsed_ms > capsule.budgets.ttl_ms {
                reasons.push("budget_ttl_exceeded".to_string());
                break 'verdict false;
            }
            if u64::from(inputs.retries) > u64::from(capsule.retry_budget) {
                reasons.push("retry_budget_exceeded".to_string());
                break 'verdict false;
            }

            true
        };

        let digest = Self::decision_digest(inputs, allow, &reasons)?;
        Ok(Decision {
            allow,
            reasons,
            digest,
            gas_used,
        })
    }

    fn rule_matches(rule: &PolicyRule, inputs: &EvalInputs) -> bool {
        if let Some(verb) = rule.verb {
            if verb != inputs.verb {
                return false;
            }
        }
        let c = &rule.conditions;
        if let Some(senders) = &c.senders {
            if !senders.contains(&inputs.sender) {
                return false;
            }
        }
        if let Some(tags) = &c.require_tags {
            if !tags.iter().all(|t| inputs.tags.contains(t)) {
                return false;
            }
        }
        if let Some(max) = c.max_credits {
            if inputs.credits > max {
                return false;
            }
        }
        if let Some(max) = c.max_payload_bytes {
            if inputs.payload_bytes > max {
                return false;
            }
        }
        true
    }

    fn decision_digest(
        inputs: &EvalInputs,
        allow: bool,
        reasons: &[String],
    ) -> Result<ContentHash, PolicyError> {
        let mut preimage =
            codec::to_bytes_canonical(inputs).map_err(PolicyError::InvalidCapsule)?;
        preimage.extend_from_slice(
            &codec::to_bytes_canonical(&(allow, reasons.to_vec()))
                .map_err(PolicyError::InvalidCapsule)?,
        );
        agora_crypto::content_hash(&preimage)
            .map_err(|e| PolicyError::InvalidCapsule(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::{Budgets, ChallengeSplit};
    use crate::gates::Gate;
    use crate::program::RuleConditions;
    use agora_types::{AgentId, Capability, VerbKind};

    fn capsule_with(rules: Vec<PolicyRule>, default: DefaultVerdict) -> PolicyCapsule {
        PolicyCapsule {
            engine_hash: engine_hash(),
            schema_version: 1,
            rules,
            default_verdict: default,
            budgets: Budgets {
                tokens: 1_000_000,
                credits: 500,
                msgs: 100,
                ttl_ms: 60_000,
            },
            challenge_split: ChallengeSplit::default(),
            retry_budget: 3,
            conformance_vector: None,
            gas_limit: 10_000,
        }
    }

    fn inputs() -> EvalInputs {
        EvalInputs::for_verb(
            Gate::Ingress,
            VerbKind::Propose,
            Capability::Planning,
            AgentId([7; 32]),
        )
    }

    #[test]
    fn default_allow_with_no_rules() {
        let d = Evaluator::new()
            .eval(&capsule_with(vec![], DefaultVerdict::AllowAll), &inputs(), 10_000)
            .unwrap();
        assert!(d.allow);
        assert!(d.reasons.is_empty());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            PolicyRule {
                verb: Some(VerbKind::Propose),
                conditions: RuleConditions::default(),
                action: RuleVerdict::Deny,
            },
            PolicyRule {
                verb: None,
                conditions: RuleConditions::default(),
                action: RuleVerdict::Allow,
            },
        ];
        let d = Evaluator::new()
            .eval(&capsule_with(rules, DefaultVerdict::AllowAll), &inputs(), 10_000)
            .unwrap();
        assert!(!d.allow);
        assert_eq!(d.reasons, vec!["rule_0_deny"]);
    }

    #[test]
    fn gas_exhaustion_denies_deterministically() {
        let rules = (0..100)
            .map(|_| PolicyRule {
                verb: Some(VerbKind::Attest),
                conditions: RuleConditions::default(),
                action: RuleVerdict::Allow,
            })
            .collect();
        let capsule = capsule_with(rules, DefaultVerdict::AllowAll);
        let a = Evaluator::new().eval(&capsule, &inputs(), 50).unwrap();
        let b = Evaluator::new().eval(&capsule, &inputs(), 50).unwrap();
        assert!(!a.allow);
        assert_eq!(a.reasons, vec!["gas_exhausted"]);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn budget_breach_is_denied_with_reason() {
        let capsule = capsule_with(vec![], DefaultVerdict::AllowAll);
        let mut i = inputs();
        i.credits = 501;
        let d = Evaluator::new().eval(&capsule, &i, 10_000).unwrap();
        assert!(!d.allow);
        assert_eq!(d.reasons, vec!["budget_credits_exceeded"]);
    }

    #[test]
    fn identical_inputs_produce_identical_digests() {
        let capsule = capsule_with(vec![], DefaultVerdict::DenyAll);
        let a = Evaluator::new().eval(&capsule, &inputs(), 10_000).unwrap();
        let b = Evaluator::new().eval(&capsule, &inputs(), 10_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn digest_separates_allow_from_deny() {
        let allow_capsule = capsule_with(vec![], DefaultVerdict::AllowAll);
        let deny_capsule = capsule_with(vec![], DefaultVerdict::DenyAll);
        let a = Evaluator::new().eval(&allow_capsule, &inputs(), 10_000).unwrap();
        let d = Evaluator::new().eval(&deny_capsule, &inputs(), 10_000).unwrap();
        assert_ne!(a.digest, d.digest);
    }

    #[test]
    fn wrong_engine_hash_is_denied() {
        let mut capsule = capsule_with(vec![], DefaultVerdict::AllowAll);
        capsule.engine_hash = ContentHash([1; 32]);
        let d = Evaluator::new().eval(&capsule, &inputs(), 10_000).unwrap();
        assert!(!d.allow);
        assert_eq!(d.reasons, vec!["engine_mismatch"]);
    }
}
