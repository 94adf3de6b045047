//! Per-domain contextual bandit.
//!
//! ε-greedy with a mandatory exploration floor for newcomers: an agent
//! with zero pulls in a domain is guaranteed at least `epsilon_new`
//! probability mass, so proven incumbents cannot starve new entrants out
//! of the routing loop entirely.

use agora_types::AgentId;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct ArmStats {
    pulls: u64,
    reward_sum: f64,
}

impl ArmStats {
    fn mean(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.reward_sum / self.pulls as f64
        }
    }
}

/// One bandit per routing domain (task type).
pub struct DomainBandit {
    domain: String,
    /// Exploration probability among seen arms.
    epsilon: f64,
    /// Mandatory exploration floor for never-pulled arms.
    epsilon_new: f64,
    arms: HashMap<AgentId, ArmStats>,
}

impl DomainBandit {
    pub fn new(domain: impl Into<String>, epsilon: f64, epsilon_new: f64) -> Self {
        Self {
            domain: domain.into(),
            epsilon: epsilon.clamp(0.0, 1.0),
            epsilon_new: epsilon_new.clamp(0.0, 1.0),
            arms: HashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Records an outcome in `[0, 1]` for an agent.
    pub fn record_outcome(&mut self, agent: AgentId, reward: f64) {
        let arm = self.arms.entry(agent).or_default();
        arm.pulls += 1;
        arm.reward_sum += reward.clamp(0.0, 1.0);
        debug!(
            target: "router",
            domain = %self.domain,
            agent = %agent,
            pulls = arm.pulls,
            mean = arm.mean(),
            "bandit outcome recorded"
        );
    }

    /// Picks one of `candidates` for the next dispatch.
    pub fn choose<R: Rng + ?Sized>(&self, candidates: &[AgentId], rng: &mut R) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }

        // Newcomer floor: with probability epsilon_new, pick uniformly
        // among candidates this domain has never pulled.
        let newcomers: Vec<AgentId> = candidates
            .iter()
            .filter(|c| self.arms.get(*c).map_or(true, |a| a.pulls == 0))
            .copied()
            .collect();
        if !newcomers.is_empty() && rng.gen_bool(self.epsilon_new) {
            return newcomers.get(rng.gen_range(0..newcomers.len())).copied();
        }

        // Standard ε-greedy over the full candidate set.
        if rng.gen_bool(self.epsilon) {
            return candidates.get(rng.gen_range(0..candidates.len())).copied();
        }
        candidates
            .iter()
            .max_by(|a, b| {
                let ma = self.arms.get(*a).map_or(0.0, ArmStats::mean);
                let mb = self.arms.get(*b).map_or(0.0, ArmStats::mean);
                ma.partial_cmp(&mb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.cmp(a))
            })
            .copied()
    }
}
