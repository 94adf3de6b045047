//! Node configuration.
//!
//! Loaded from TOML; every field has a default so a bare `[kernel]` table is
//! a working single-org test cluster. Quorum sizes are *targets*: while the
//! network bootstraps, the effective quorum scales with the number of active
//! staked verifiers.

use crate::verb::ChallengeClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Target number of distinct plan attestations to decide a need slot.
    pub k_plan: u32,
    /// Target number of distinct result attestations to verify a task.
    pub k_result: u32,
    /// Challenge window after COMMIT, milliseconds.
    pub t_challenge_ms: u64,
    /// Lease duration; a lease exactly at TTL is expired.
    pub lease_ttl_ms: u64,
    /// How long a need slot collects proposals before quorum evaluation.
    pub bid_window_ms: u64,
    /// Lease keep-alive cadence. The scavenger fires after a full TTL
    /// without a heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Base delay for randomized exponential retry backoff, milliseconds.
    pub backoff_base_ms: u64,
    /// Gas ceiling for a single policy evaluation.
    pub gas_limit: u64,
    /// Emit a checkpoint every this many finalized facts...
    pub checkpoint_epoch_interval: u64,
    /// ...or after this much wall-clock time with any new facts at all.
    pub checkpoint_interval_ms: u64,
    /// Minimum challenger bond before class weighting.
    pub challenge_base_bond: u64,
    /// Per-class ceilings on verify bounties, in credits.
    pub bounty_caps_by_class: BTreeMap<ChallengeClass, u64>,
    pub bootstrap: BootstrapConfig,
    pub diversity_caps: DiversityCaps,
}

/// Bootstrap-mode quorum scaling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapConfig {
    pub enabled: bool,
    /// Floor for the effective plan quorum while bootstrapping.
    pub k_plan_min: u32,
    /// Floor for the effective result quorum while bootstrapping.
    pub k_result_min: u32,
    /// Exit bootstrap once this many staked verifiers are active...
    pub verifier_threshold_m: u32,
    /// ...for this many consecutive stability observations.
    pub stability_d: u32,
    /// Alternative exit: this many jobs finalized under bootstrap.
    pub exit_after_finalized: u64,
    /// Fraction of active staked verifiers counted toward the quorum.
    pub alpha: f64,
}

/// Hard per-committee caps on the share of any single entity, as fractions
/// in `(0, 1]`. A selection that violates any cap is rejected and retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiversityCaps {
    pub per_org: f64,
    pub per_asn: f64,
    pub per_region: f64,
    pub per_cluster: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            k_plan: 2,
            k_result: 3,
            t_challenge_ms: 60_000,
            lease_ttl_ms: 30_000,
            bid_window_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            backoff_base_ms: 250,
            gas_limit: 10_000,
            checkpoint_epoch_interval: 64,
            checkpoint_interval_ms: 300_000,
            challenge_base_bond: 10,
            bounty_caps_by_class: BTreeMap::new(),
            bootstrap: BootstrapConfig::default(),
            diversity_caps: DiversityCaps::default(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k_plan_min: 1,
            k_result_min: 1,
            verifier_threshold_m: 7,
            stability_d: 24,
            exit_after_finalized: 64,
            alpha: 0.3,
        }
    }
}

impl Default for DiversityCaps {
    fn default() -> Self {
        Self {
            per_org: 0.34,
            per_asn: 0.5,
            per_region: 0.5,
            per_cluster: 0.34,
        }
    }
}

impl KernelConfig {
    /// Effective quorum size given the current verifier population:
    /// `min(target, max(floor, ⌊active · alpha⌋))` while bootstrapping,
    /// the plain target otherwise.
    pub fn effective_quorum(&self, target: u32, floor: u32, active_staked_verifiers: u32) -> u32 {
        if !self.bootstrap.enabled {
            return target;
        }
        let scaled = (f64::from(active_staked_verifiers) * self.bootstrap.alpha).floor() as u32;
        target.min(floor.max(scaled))
    }

    /// Effective plan quorum for the current verifier population.
    pub fn effective_k_plan(&self, active_staked_verifiers: u32) -> u32 {
        self.effective_quorum(self.k_plan, self.bootstrap.k_plan_min, active_staked_verifiers)
    }

    /// Effective result quorum for the current verifier population.
    pub fn effective_k_result(&self, active_staked_verifiers: u32) -> u32 {
        self.effective_quorum(
            self.k_result,
            self.bootstrap.k_result_min,
            active_staked_verifiers,
        )
    }
}
