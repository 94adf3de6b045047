//! The append-only plan log.
//!
//! Arrival order is kept for audit; meaning lives in the derived view.
//! The apply phase is single-writer per node — the node funnels every
//! accepted fact through one queue — so this type does no internal locking.

use crate::merkle::{merkle_proof, merkle_root, MerkleProof};
use crate::view::{DerivedView, ViewSnapshot};
use agora_types::error::CryptoError;
use agora_types::{codec, ContentHash, FactRecord};
use parity_scale_codec::Encode;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Proof retained for a pruned record.
#[derive(Debug, Clone)]
pub struct PrunedRecordProof {
    /// Root of the Merkle tree built over the pruned batch.
    pub batch_root: ContentHash,
    pub proof: MerkleProof,
}

/// The local replica of the shared plan log.
#[derive(Default)]
pub struct PlanLog {
    records: Vec<FactRecord>,
    seen: HashSet<ContentHash>,
    view: DerivedView,
    /// Records dropped from hot storage, retained as inclusion proofs.
    pruned: BTreeMap<ContentHash, PrunedRecordProof>,
    /// How many records have been pruned ahead of `records[0]`.
    pruned_count: u64,
}

impl PlanLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log replica from a verified checkpoint snapshot.
    pub fn from_snapshot(snapshot: ViewSnapshot, pruned_count: u64) -> Self {
        Self {
            records: Vec::new(),
            seen: HashSet::new(),
            view: snapshot.restore(),
            pruned: BTreeMap::new(),
            pruned_count,
        }
    }

    /// Appends one fact record. Returns false on a duplicate envelope id.
    pub fn append(&mut self, rec: FactRecord) -> bool {
        if !self.seen.insert(rec.envelope_id) {
            return false;
        }
        self.view.apply(&rec);
        debug!(target: "plan", envelope = %rec.envelope_id, lamport = rec.lamport, "fact appended");
        self.records.push(rec);
        true
    }

    /// Set-union merge with a batch of remote records (gossip/anti-entropy).
    /// Returns how many were new.
    pub fn merge<I: IntoIterator<Item = FactRecord>>(&mut self, batch: I) -> usize {
        batch.into_iter().filter(|r| self.append(r.clone())).count()
    }

    pub fn view(&self) -> &DerivedView {
        &self.view
    }

    /// Total facts ever accepted, including pruned ones.
    pub fn total_len(&self) -> u64 {
        self.pruned_count + self.records.len() as u64
    }

    /// Facts currently in hot storage.
    pub fn hot_records(&self) -> &[FactRecord] {
        &self.records
    }

    /// Hot records at or after absolute sequence `seq`, with their
    /// sequences (persistence tail-sync).
    pub fn records_from(&self, seq: u64) -> impl Iterator<Item = (u64, &FactRecord)> {
        let skip = seq.saturating_sub(self.pruned_count) as usize;
        let base = self.pruned_count;
        self.records
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(i, r)| (base + i as u64, r))
    }

    /// Canonical digest of the derived view; equal on convergent replicas.
    pub fn view_digest(&self) -> Result<ContentHash, CryptoError> {
        let bytes = codec::to_bytes_canonical(&self.view.snapshot())
            .map_err(CryptoError::InvalidInput)?;
        agora_crypto::content_hash(&bytes)
    }

    /// Merkle root over the derived view, the value CHECKPOINT facts carry.
    pub fn checkpoint_root(&self) -> Result<ContentHash, CryptoError> {
        merkle_root(&self.view.snapshot().leaves())
    }

    /// Drops hot records up to (excluding) absolute sequence `upto`,
    /// retaining a Merkle inclusion proof per dropped record. Only safe for
    /// sequences at or below a stable checkpoint.
    pub fn prune_before(&mut self, upto: u64) -> Result<usize, CryptoError> {
        if upto <= self.pruned_count {
            return Ok(0);
        }
        let local = ((upto - self.pruned_count) as usize).min(self.records.len());
        if local == 0 {
            return Ok(0);
        }
        let batch: Vec<FactRecord> = self.records.drain(..local).collect();
        let leaves: Vec<Vec<u8>> = batch.iter().map(|r| r.encode()).collect();
        let batch_root = merkle_root(&leaves)?;
        for (i, rec) in batch.iter().enumerate() {
            let proof = merkle_proof(&leaves, i)?;
            self.pruned
                .insert(rec.envelope_id, PrunedRecordProof { batch_root, proof });
        }
        self.pruned_count += local as u64;
        debug!(target: "plan", pruned = local, total = self.pruned_count, "hot log pruned");
        Ok(local)
    }

    /// Inclusion proof for a pruned record, if we pruned it.
    pub fn pruned_proof(&self, envelope_id: &ContentHash) -> Option<&PrunedRecordProof> {
        self.pruned.get(envelope_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::verify_proof;
    use agora_types::{AgentId, Fact, NeedId, ProposalId, TaskId, TaskState};

    fn rec(env: u8, lamport: u64, actor: u8, fact: Fact) -> FactRecord {
        FactRecord {
            envelope_id: ContentHash([env; 32]),
            lamport,
            actor: AgentId([actor; 32]),
            fact,
        }
    }

    fn task(b: u8) -> TaskId {
        TaskId([b; 32])
    }

    #[test]
    fn duplicates_are_dropped_by_envelope_id() {
        let mut log = PlanLog::new();
        let r = rec(
            1,
            1,
            1,
            Fact::AddTask {
                task: task(1),
                task_type: "t".into(),
                requires: vec![],
                produces: vec![],
            },
        );
        assert!(log.append(r.clone()));
        assert!(!log.append(r));
        assert_eq!(log.total_len(), 1);
    }

    #[test]
    fn merge_order_does_not_change_the_view() {
        let facts = vec![
            rec(
                1,
                1,
                1,
                Fact::AddTask {
                    task: task(1),
                    task_type: "root".into(),
                    requires: vec![],
                    produces: vec![],
                },
            ),
            rec(
                2,
                2,
                1,
                Fact::AddTask {
                    task: task(2),
                    task_type: "child".into(),
                    requires: vec![],
                    produces: vec![],
                },
            ),
            rec(
                3,
                3,
                1,
                Fact::Link {
                    parent: task(1),
                    child: task(2),
                },
            ),
            rec(
                4,
                4,
                2,
                Fact::Annotate {
                    task: task(2),
                    key: "status".into(),
                    val: "draft".into(),
                },
            ),
            rec(
                5,
                5,
                3,
                Fact::Annotate {
                    task: task(2),
                    key: "status".into(),
                    val: "review".into(),
                },
            ),
            rec(
                6,
                6,
                1,
                Fact::State {
                    task: task(2),
                    state: TaskState::Decided,
                },
            ),
            rec(
                7,
                7,
                2,
                Fact::Decide {
                    need: NeedId([9; 32]),
                    proposal: ProposalId([1; 32]),
                    epoch: 1,
                },
            ),
        ];

        // Apply in several fixed permutations; identical digests expected.
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3, 4, 5, 6],
            vec![6, 5, 4, 3, 2, 1, 0],
            vec![3, 0, 6, 2, 5, 1, 4],
            vec![2, 4, 0, 5, 6, 1, 3],
        ];
        let mut digests = Vec::new();
        for order in orders {
            let mut log = PlanLog::new();
            for idx in order {
                log.append(facts[idx].clone());
            }
            digests.push(log.view_digest().unwrap());
        }
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn lww_annotation_takes_the_greater_write_key() {
        let mut log = PlanLog::new();
        log.append(rec(
            1,
            5,
            3,
            Fact::Annotate {
                task: task(1),
                key: "k".into(),
                val: "older".into(),
            },
        ));
        log.append(rec(
            2,
            5,
            4,
            Fact::Annotate {
                task: task(1),
                key: "k".into(),
                val: "newer-actor".into(),
            },
        ));
        let node = log.view().task(&task(1)).unwrap();
        assert_eq!(node.annotations.get("k").unwrap().val, "newer-actor");
    }

    #[test]
    fn state_never_regresses() {
        let mut log = PlanLog::new();
        log.append(rec(
            1,
            1,
            1,
            Fact::State {
                task: task(1),
                state: TaskState::Verified,
            },
        ));
        log.append(rec(
            2,
            2,
            1,
            Fact::State {
                task: task(1),
                state: TaskState::Draft,
            },
        ));
        assert_eq!(log.view().task(&task(1)).unwrap().state, TaskState::Verified);
    }

    #[test]
    fn higher_epoch_decide_wins_and_orphans_the_loser() {
        let mut log = PlanLog::new();
        let need = NeedId([9; 32]);
        let p_a = ProposalId([1; 32]);
        let p_b = ProposalId([2; 32]);
        // Branch A: root 1 -> child 3. Branch B: root 2 -> child 4.
        for (env, l, f) in [
            (
                1,
                1,
                Fact::Link {
                    parent: p_a.root_task(),
                    child: task(3),
                },
            ),
            (
                2,
                2,
                Fact::Link {
                    parent: p_b.root_task(),
                    child: task(4),
                },
            ),
            (
                3,
                3,
                Fact::Decide {
                    need,
                    proposal: p_a,
                    epoch: 1,
                },
            ),
            (
                4,
                4,
                Fact::Decide {
                    need,
                    proposal: p_b,
                    epoch: 2,
                },
            ),
        ] {
            log.append(rec(env, l, 1, f));
        }
        let effective = log.view().effective_decide(&need).unwrap();
        assert_eq!(effective.proposal, p_b);
        assert_eq!(effective.epoch, 2);
        assert!(log.view().is_orphaned(&p_a.root_task()));
        assert!(log.view().is_orphaned(&task(3)));
        assert!(!log.view().is_orphaned(&task(4)));
    }

    #[test]
    fn cycle_creating_link_is_ignored_in_the_view() {
        let mut log = PlanLog::new();
        log.append(rec(
            1,
            1,
            1,
            Fact::Link {
                parent: task(1),
                child: task(2),
            },
        ));
        log.append(rec(
            2,
            2,
            1,
            Fact::Link {
                parent: task(2),
                child: task(3),
            },
        ));
        assert!(log.view().would_cycle(task(3), task(1)));
        log.append(rec(
            3,
            3,
            1,
            Fact::Link {
                parent: task(3),
                child: task(1),
            },
        ));
        // The cycle edge is excluded from the effective set.
        assert_eq!(log.view().edges().len(), 2);
    }

    #[test]
    fn pruning_keeps_verifiable_proofs() {
        let mut log = PlanLog::new();
        for i in 0..6u8 {
            log.append(rec(
                i + 1,
                u64::from(i) + 1,
                1,
                Fact::Annotate {
                    task: task(1),
                    key: format!("k{}", i),
                    val: "v".into(),
                },
            ));
        }
        let victim = log.hot_records()[2].clone();
        let pruned = log.prune_before(4).unwrap();
        assert_eq!(pruned, 4);
        assert_eq!(log.total_len(), 6);
        assert_eq!(log.hot_records().len(), 2);

        let kept = log.pruned_proof(&victim.envelope_id).unwrap();
        assert!(verify_proof(&kept.batch_root, &victim.encode(), &kept.proof).unwrap());
    }

    #[test]
    fn snapshot_restore_matches_original_digest() {
        let mut log = PlanLog::new();
        log.append(rec(
            1,
            1,
            1,
            Fact::AddTask {
                task: task(1),
                task_type: "root".into(),
                requires: vec!["text".into()],
                produces: vec![],
            },
        ));
        log.append(rec(
            2,
            2,
            1,
            Fact::Link {
                parent: task(1),
                child: task(2),
            },
        ));
        let snapshot = log.view().snapshot();
        let restored = PlanLog::from_snapshot(snapshot, log.total_len());
        assert_eq!(restored.view_digest().unwrap(), log.view_digest().unwrap());
    }
}
