//! Filter, shortlist, diversity-capped committee assembly, and the canary
//! pair.

use crate::RouterError;
use agora_types::config::DiversityCaps;
use agora_types::manifest::CandidateProfile;
use agora_types::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Score weights. Tunable per deployment; these defaults favor proven
/// reputation over raw stake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub alpha_reputation: f64,
    pub beta_price: f64,
    pub gamma_latency: f64,
    pub delta_domain_fit: f64,
    pub epsilon_recency: f64,
    pub zeta_stake: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            alpha_reputation: 3.0,
            beta_price: 1.0,
            gamma_latency: 1.0,
            delta_domain_fit: 2.0,
            epsilon_recency: 0.5,
            zeta_stake: 1.0,
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub weights: ScoreWeights,
    pub diversity_caps: DiversityCaps,
    /// Per-entity ceiling applied to a single score term so one whale
    /// cannot dominate the shortlist on stake alone.
    pub score_term_cap: Option<f64>,
}

/// The top-2 dispatch used to calibrate before committing real work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryPair {
    pub primary: AgentId,
    pub secondary: AgentId,
}

/// The selection pipeline over a candidate roster.
pub struct Selector {
    config: RouterConfig,
}

impl Selector {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Filter: declared capability tag, price within budget, and activity
    /// within the recency horizon.
    pub fn filter<'a>(
        &self,
        roster: &'a [CandidateProfile],
        task_type: &str,
        budget: u64,
        now_epoch: u64,
        max_idle_epochs: u64,
    ) -> Vec<&'a CandidateProfile> {
        roster
            .iter()
            .filter(|c| c.capability.tags.iter().any(|t| t == task_type))
            .filter(|c| c.capability.price <= budget)
            .filter(|c| now_epoch.saturating_sub(c.last_active_epoch) <= max_idle_epochs)
            .collect()
    }

    /// Shortlist score:
    /// `α·reputation + β·price⁻¹ + γ·latency⁻¹ + δ·domain_fit + ε·recency + ζ·√stake`.
    pub fn score(&self, c: &CandidateProfile, now_epoch: u64) -> f64 {
        let w = &self.config.weights;
        let cap = |term: f64| match self.config.score_term_cap {
            Some(cap) => term.min(cap),
            None => term,
        };
        let price_inv = 1.0 / (c.capability.price.max(1) as f64);
        let latency_inv = 1.0 / (c.p95_latency_ms.max(1) as f64);
        let recency = 1.0 / (1.0 + now_epoch.saturating_sub(c.last_active_epoch) as f64);
        cap(w.alpha_reputation * c.reputation)
            + cap(w.beta_price * price_inv)
            + cap(w.gamma_latency * latency_inv)
            + cap(w.delta_domain_fit * c.domain_fit)
            + cap(w.epsilon_recency * recency)
            + cap(w.zeta_stake * (c.stake as f64).sqrt())
    }

    /// Ranks filtered candidates best-first. Ties break on agent id so the
    /// ordering is total and reproducible.
    pub fn shortlist<'a>(
        &self,
        filtered: Vec<&'a CandidateProfile>,
        now_epoch: u64,
    ) -> Vec<&'a CandidateProfile> {
        let mut scored: Vec<(f64, &CandidateProfile)> = filtered
            .into_iter()
            .map(|c| (self.score(c, now_epoch), c))
            .collect();
        scored.sort_by(|(sa, ca), (sb, cb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ca.agent_id.cmp(&cb.agent_id))
        });
        scored.into_iter().map(|(_, c)| c).collect()
    }

    /// The canary dispatch: the two best-ranked candidates.
    pub fn canary_pair(&self, shortlist: &[&CandidateProfile]) -> Option<CanaryPair> {
        let mut it = shortlist.iter();
        let primary = it.next()?.agent_id;
        let secondary = it.next()?.agent_id;
        Some(CanaryPair { primary, secondary })
    }

    /// Assembles a committee of `size` from the shortlist under the hard
    /// diversity caps. A candidate whose entity share would breach a cap
    /// is skipped (the "reject and recompose" loop, expressed as a greedy
    /// scan over the ranked list). Errs if the caps cannot be met.
    pub fn select_committee(
        &self,
        shortlist: &[&CandidateProfile],
        size: usize,
    ) -> Result<Vec<AgentId>, RouterError> {
        if shortlist.len() < size {
            return Err(RouterError::InsufficientCandidates {
                need: size,
                have: shortlist.len(),
            });
        }
        let caps = &self.config.diversity_caps;
        let limit = |share: f64| ((share * size as f64).ceil() as usize).max(1);
        let (org_cap, asn_cap, region_cap, cluster_cap) = (
            limit(caps.per_org),
            limit(caps.per_asn),
            limit(caps.per_region),
            limit(caps.per_cluster),
        );

        let mut committee = Vec::with_capacity(size);
        let mut org_counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut asn_counts: BTreeMap<u32, usize> = BTreeMap::new();
        let mut region_counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut cluster_counts: BTreeMap<u64, usize> = BTreeMap::new();

        for c in shortlist {
            if committee.len() == size {
                break;
            }
            let org = org_counts.get(c.org.as_str()).copied().unwrap_or(0);
            let asn = asn_counts.get(&c.asn).copied().unwrap_or(0);
            let region = region_counts.get(c.region.as_str()).copied().unwrap_or(0);
            let cluster = cluster_counts.get(&c.identity_cluster).copied().unwrap_or(0);
            if org + 1 > org_cap
                || asn + 1 > asn_cap
                || region + 1 > region_cap
                || cluster + 1 > cluster_cap
            {
                debug!(
                    target: "router",
                    agent = %c.agent_id,
                    org = %c.org,
                    "candidate skipped by diversity cap"
                );
                continue;
            }
            *org_counts.entry(c.org.as_str()).or_insert(0) += 1;
            *asn_counts.entry(c.asn).or_insert(0) += 1;
            *region_counts.entry(c.region.as_str()).or_insert(0) += 1;
            *cluster_counts.entry(c.identity_cluster).or_insert(0) += 1;
            committee.push(c.agent_id);
        }

        if committee.len() < size {
            return Err(RouterError::DiversityUnsatisfiable(format!(
                "assembled {} of {} under caps",
                committee.len(),
                size
            )));
        }
        Ok(committee)
    }
}
