//! Checkpoint attestation tracking and newcomer verification.
//!
//! A CHECKPOINT fact is an opinion until a plan quorum of distinct
//! verifiers has attested the same `(epoch, root)`. Stable checkpoints
//! authorize pruning and anchor newcomer bootstrap.

use crate::merkle::merkle_root;
use crate::view::ViewSnapshot;
use agora_types::error::IntegrityError;
use agora_types::{AgentId, ContentHash};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A checkpoint that reached its attestation quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableCheckpoint {
    pub epoch: u64,
    pub merkle_root: ContentHash,
    pub attestors: BTreeSet<AgentId>,
    /// Absolute fact sequence the snapshot covers; pruning bound.
    pub upto_records: u64,
}

/// Tallies checkpoint attestations per `(epoch, root)`.
#[derive(Default)]
pub struct CheckpointTracker {
    pending: BTreeMap<(u64, ContentHash), (BTreeSet<AgentId>, u64)>,
    stable: BTreeMap<u64, StableCheckpoint>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one attestation. Duplicate attestors are ignored. Returns
    /// the checkpoint if this attestation made it stable.
    pub fn record(
        &mut self,
        epoch: u64,
        root: ContentHash,
        attestor: AgentId,
        upto_records: u64,
        k_plan: u32,
    ) -> Option<&StableCheckpoint> {
        if self.stable.contains_key(&epoch) {
            return None;
        }
        let (attestors, upto) = self
            .pending
            .entry((epoch, root))
            .or_insert_with(|| (BTreeSet::new(), upto_records));
        attestors.insert(attestor);
        *upto = (*upto).max(upto_records);

        if attestors.len() as u32 >= k_plan {
            let checkpoint = StableCheckpoint {
                epoch,
                merkle_root: root,
                attestors: attestors.clone(),
                upto_records: *upto,
            };
            info!(
                target: "plan",
                epoch,
                root = %root,
                attestors = checkpoint.attestors.len(),
                "checkpoint stable"
            );
            self.pending.retain(|(e, _), _| *e != epoch);
            self.stable.insert(epoch, checkpoint);
            return self.stable.get(&epoch);
        }
        None
    }

    pub fn latest_stable(&self) -> Option<&StableCheckpoint> {
        self.stable.values().next_back()
    }

    pub fn stable_at(&self, epoch: u64) -> Option<&StableCheckpoint> {
        self.stable.get(&epoch)
    }
}

/// Newcomer-side verification: does this snapshot hash to the attested
/// root?
pub fn verify_snapshot(
    epoch: u64,
    snapshot: &ViewSnapshot,
    expected_root: &ContentHash,
) -> Result<(), IntegrityError> {
    let got = merkle_root(&snapshot.leaves()).unwrap_or(ContentHash([0; 32]));
    if got != *expected_root {
        return Err(IntegrityError::CheckpointMismatch {
            epoch,
            expected: *expected_root,
            got,
        });
    }
    Ok(())
}
