//! The capsule rule program.
//!
//! Deliberately not a language: a linear, first-match-wins list of rules
//! over a closed condition set, with an explicit default. Evaluation cost
//! is linear in the rule count and bounded by gas, so a capsule can never
//! make ingress slow.

use agora_types::{AgentId, VerbKind};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The verdict a matched rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerdict {
    Allow,
    Deny,
}

/// Behavior when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum DefaultVerdict {
    AllowAll,
    DenyAll,
}

/// One rule: an optional verb target plus refining conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PolicyRule {
    /// Verb this rule targets; `None` matches every verb.
    pub verb: Option<VerbKind>,
    pub conditions: RuleConditions,
    pub action: RuleVerdict,
}

/// Conditions that refine when a rule applies. All present conditions must
/// hold for the rule to match.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RuleConditions {
    /// Restrict to these senders.
    pub senders: Option<Vec<AgentId>>,
    /// Require every one of these tags on the message.
    pub require_tags: Option<Vec<String>>,
    /// Upper bound on credits the message moves or escrows.
    pub max_credits: Option<u64>,
    /// Upper bound on the referenced payload size.
    pub max_payload_bytes: Option<u64>,
}

impl RuleConditions {
    /// Number of checks this condition set performs; the gas meter charges
    /// one unit per check.
    pub fn check_count(&self) -> u64 {
        [
            self.senders.is_some(),
            self.require_tags.is_some(),
            self.max_credits.is_some(),
            self.max_payload_bytes.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count() as u64
    }
}
