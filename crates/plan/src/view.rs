//! The derived view: what the fact set means.
//!
//! Every mutation here is commutative, associative, and idempotent over
//! fact records, with one wrinkle: link edges and orphan tags depend on
//! more than one fact, so they are recomputed from sorted inputs whenever
//! a contributing fact arrives. Recomputation always sorts by write key,
//! which makes the result independent of arrival order.

use agora_types::verb::ReconcileSummary;
use agora_types::{AgentId, ContentHash, Fact, FactRecord, NeedId, ProposalId, TaskId, TaskState, ThreadId};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An LWW annotation cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AnnotationCell {
    pub val: String,
    /// `(lamport, actor)` of the winning write.
    pub written: (u64, AgentId),
}

/// A task node in the derived graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TaskNode {
    pub task_type: String,
    pub requires: BTreeSet<String>,
    pub produces: BTreeSet<ContentHash>,
    pub annotations: BTreeMap<String, AnnotationCell>,
    pub state: TaskState,
    /// Terminal rejection flag; the only sanctioned "regression".
    pub invalidated: bool,
    /// Write key of the `ADD_TASK` that defined the metadata, if any.
    metadata_key: Option<(u64, AgentId)>,
}

impl TaskNode {
    fn placeholder() -> Self {
        Self {
            task_type: String::new(),
            requires: BTreeSet::new(),
            produces: BTreeSet::new(),
            annotations: BTreeMap::new(),
            state: TaskState::Draft,
            invalidated: false,
            metadata_key: None,
        }
    }

    /// Terminal means no further lifecycle movement is possible.
    pub fn is_terminal(&self) -> bool {
        self.invalidated || self.state == TaskState::Final
    }
}

/// One DECIDE as recorded in the log. Ordered by `(epoch, lamport,
/// proposer)`: the derive relies on field order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct DecideRecord {
    pub epoch: u64,
    pub lamport: u64,
    pub proposer: AgentId,
    pub proposal: ProposalId,
}

/// The materialized meaning of the fact set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DerivedView {
    tasks: BTreeMap<TaskId, TaskNode>,
    /// Raw link facts with their write keys; inputs to edge resolution.
    links: BTreeSet<((u64, AgentId), TaskId, TaskId)>,
    /// Cycle-free edge set resolved from `links` in write-key order.
    effective_edges: BTreeSet<(TaskId, TaskId)>,
    /// Every DECIDE seen, per need. The maximum is the effective one.
    decides: BTreeMap<NeedId, BTreeSet<DecideRecord>>,
    reconciles: BTreeMap<ContentHash, (ThreadId, ReconcileSummary)>,
    /// Checkpoint roots by epoch, LWW on conflicting roots.
    checkpoints: BTreeMap<u64, (ContentHash, (u64, AgentId))>,
    /// Tasks under decision branches that lost an epoch race.
    orphaned: BTreeSet<TaskId>,
}

impl DerivedView {
    /// Applies one fact record. Idempotent re-application is harmless; the
    /// log's dedup normally prevents it anyway.
    pub fn apply(&mut self, rec: &FactRecord) {
        let key = rec.write_key();
        match &rec.fact {
            Fact::AddTask {
                task,
                task_type,
                requires,
                produces,
            } => {
                let node = self.tasks.entry(*task).or_insert_with(TaskNode::placeholder);
                // Same LWW rule as annotations: greater write key defines
                // the metadata, equal keys break on the value.
                let wins = match node.metadata_key {
                    None => true,
                    Some(k) => key > k || (key == k && *task_type > node.task_type),
                };
                if wins {
                    node.task_type = task_type.clone();
                    node.metadata_key = Some(key);
                }
                node.requires.extend(requires.iter().cloned());
                // Declared produced *types* are advisory; concrete
                // artifacts arrive via PRODUCES facts.
                let _ = produces;
            }
            Fact::Requires {
                task,
                artifact_type,
            } => {
                self.tasks
                    .entry(*task)
                    .or_insert_with(TaskNode::placeholder)
                    .requires
                    .insert(artifact_type.clone());
            }
            Fact::Produces { task, artifact } => {
                self.tasks
                    .entry(*task)
                    .or_insert_with(TaskNode::placeholder)
                    .produces
                    .insert(*artifact);
            }
            Fact::Link { parent, child } => {
                self.links.insert((key, *parent, *child));
                self.tasks.entry(*parent).or_insert_with(TaskNode::placeholder);
                self.tasks.entry(*child).or_insert_with(TaskNode::placeholder);
                self.resolve_edges();
                self.recompute_orphans();
            }
            Fact::Annotate { task, key: akey, val } => {
                let node = self.tasks.entry(*task).or_insert_with(TaskNode::placeholder);
                // LWW by write key; equal keys (an equivocating actor)
                // break on the value so the outcome is still order-free.
                let wins = match node.annotations.get(akey) {
                    None => true,
                    Some(cell) => key > cell.written || (key == cell.written && *val > cell.val),
                };
                if wins {
                    node.annotations.insert(
                        akey.clone(),
                        AnnotationCell {
                            val: val.clone(),
                            written: key,
                        },
                    );
                }
            }
            Fact::State { task, state } => {
                let node = self.tasks.entry(*task).or_insert_with(TaskNode::placeholder);
                node.state = node.state.max(*state);
            }
            Fact::Decide {
                need,
                proposal,
                epoch,
            } => {
                self.decides.entry(*need).or_default().insert(DecideRecord {
                    epoch: *epoch,
                    lamport: rec.lamport,
                    proposer: rec.actor,
                    proposal: *proposal,
                });
                self.recompute_orphans();
            }
            Fact::Finalize { task } => {
                let node = self.tasks.entry(*task).or_insert_with(TaskNode::placeholder);
                node.state = node.state.max(TaskState::Final);
            }
            Fact::Invalidate { task } => {
                self.tasks
                    .entry(*task)
                    .or_insert_with(TaskNode::placeholder)
                    .invalidated = true;
            }
            Fact::Reconcile { thread, summary } => {
                self.reconciles
                    .insert(rec.envelope_id, (*thread, summary.clone()));
            }
            Fact::Checkpoint { epoch, merkle_root } => {
                let wins = match self.checkpoints.get(epoch) {
                    None => true,
                    Some((root, written)) => {
                        key > *written || (key == *written && merkle_root.0 > root.0)
                    }
                };
                if wins {
                    self.checkpoints.insert(*epoch, (*merkle_root, key));
                }
            }
        }
    }

    /// Resolves the cycle-free edge set from raw links, in write-key order.
    fn resolve_edges(&mut self) {
        let mut edges: BTreeSet<(TaskId, TaskId)> = BTreeSet::new();
        for (_, parent, child) in &self.links {
            if parent == child || Self::reaches(&edges, *child, *parent) {
                continue;
            }
            edges.insert((*parent, *child));
        }
        self.effective_edges = edges;
    }

    /// Whether `from` reaches `to` through `edges`.
    fn reaches(edges: &BTreeSet<(TaskId, TaskId)>, from: TaskId, to: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(cur) = stack.pop() {
            if cur == to {
                return true;
            }
            if !seen.insert(cur) {
                continue;
            }
            stack.extend(
                edges
                    .range((cur, TaskId([0; 32]))..=(cur, TaskId([0xFF; 32])))
                    .map(|(_, c)| *c),
            );
        }
        false
    }

    /// Would accepting `parent -> child` close a cycle? Ingress uses this
    /// to refuse cycle-creating links before they ever enter the log.
    pub fn would_cycle(&self, parent: TaskId, child: TaskId) -> bool {
        parent == child || Self::reaches(&self.effective_edges, child, parent)
    }

    fn subtree(&self, root: TaskId) -> BTreeSet<TaskId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(cur) = stack.pop() {
            if !out.insert(cur) {
                continue;
            }
            stack.extend(
                self.effective_edges
                    .range((cur, TaskId([0; 32]))..=(cur, TaskId([0xFF; 32])))
                    .map(|(_, c)| *c),
            );
        }
        out
    }

    /// Re-derives orphan tags from the decide sets and current edges.
    fn recompute_orphans(&mut self) {
        let mut orphaned = BTreeSet::new();
        for records in self.decides.values() {
            let Some(winner) = records.iter().next_back() else {
                continue;
            };
            let protected = self.subtree(winner.proposal.root_task());
            for loser in records.iter().filter(|r| *r != winner) {
                for task in self.subtree(loser.proposal.root_task()) {
                    if !protected.contains(&task) {
                        orphaned.insert(task);
                    }
                }
            }
        }
        self.orphaned = orphaned;
    }

    // --- Queries ---

    pub fn task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&TaskId, &TaskNode)> {
        self.tasks.iter()
    }

    pub fn edges(&self) -> &BTreeSet<(TaskId, TaskId)> {
        &self.effective_edges
    }

    /// The effective DECIDE for a need: max `(epoch, lamport, proposer)`.
    pub fn effective_decide(&self, need: &NeedId) -> Option<&DecideRecord> {
        self.decides.get(need).and_then(|s| s.iter().next_back())
    }

    /// All decide records ever seen for a need, ascending.
    pub fn decide_history(&self, need: &NeedId) -> impl Iterator<Item = &DecideRecord> {
        self.decides.get(need).into_iter().flatten()
    }

    pub fn is_orphaned(&self, task: &TaskId) -> bool {
        self.orphaned.contains(task)
    }

    /// Orphaned tasks that still carry attested artifacts — candidates for
    /// reattachment as alternates during reconciliation.
    pub fn salvageable(&self) -> impl Iterator<Item = &TaskId> {
        self.orphaned
            .iter()
            .filter(|t| self.tasks.get(*t).is_some_and(|n| !n.produces.is_empty()))
    }

    pub fn checkpoint_root(&self, epoch: u64) -> Option<ContentHash> {
        self.checkpoints.get(&epoch).map(|(root, _)| *root)
    }

    pub fn reconciles(&self) -> impl Iterator<Item = &(ThreadId, ReconcileSummary)> {
        self.reconciles.values()
    }

    // --- Snapshots ---

    /// A canonical, order-fixed snapshot of the effective view. Equal views
    /// produce equal snapshots and therefore equal digests.
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            tasks: self
                .tasks
                .iter()
                .map(|(id, node)| (*id, node.clone()))
                .collect(),
            edges: self.effective_edges.iter().copied().collect(),
            decides: self
                .decides
                .iter()
                .filter_map(|(need, recs)| recs.iter().next_back().map(|r| (*need, *r)))
                .collect(),
            orphaned: self.orphaned.iter().copied().collect(),
            checkpoints: self
                .checkpoints
                .iter()
                .map(|(e, (root, _))| (*e, *root))
                .collect(),
        }
    }
}

/// Canonical serialization target for checkpoints and convergence checks.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ViewSnapshot {
    pub tasks: Vec<(TaskId, TaskNode)>,
    pub edges: Vec<(TaskId, TaskId)>,
    pub decides: Vec<(NeedId, DecideRecord)>,
    pub orphaned: Vec<TaskId>,
    pub checkpoints: Vec<(u64, ContentHash)>,
}

impl ViewSnapshot {
    /// Rebuilds a view from a verified snapshot (newcomer bootstrap).
    ///
    /// Snapshot entries are seeded with the zero write key, so any live
    /// fact that arrives afterwards wins its LWW race against them.
    pub fn restore(self) -> DerivedView {
        let zero_key = (0u64, AgentId([0; 32]));
        let mut view = DerivedView {
            tasks: self.tasks.into_iter().collect(),
            links: self
                .edges
                .iter()
                .map(|(p, c)| (zero_key, *p, *c))
                .collect(),
            effective_edges: self.edges.into_iter().collect(),
            decides: BTreeMap::new(),
            reconciles: BTreeMap::new(),
            checkpoints: self
                .checkpoints
                .into_iter()
                .map(|(e, root)| (e, (root, zero_key)))
                .collect(),
            orphaned: self.orphaned.into_iter().collect(),
        };
        for (need, rec) in self.decides {
            view.decides.entry(need).or_default().insert(rec);
        }
        view
    }

    /// The Merkle leaves: one canonical record per snapshot section entry.
    ///
    /// Checkpoint cells are deliberately excluded: a CHECKPOINT fact must
    /// not change the root that later attestors of the same epoch compute,
    /// or no second attestation could ever match the first. The root
    /// covers operational state; checkpoint history rides in the snapshot
    /// body for bootstrap.
    pub fn leaves(&self) -> Vec<Vec<u8>> {
        let mut leaves = Vec::new();
        for t in &self.tasks {
            leaves.push(t.encode());
        }
        for e in &self.edges {
            leaves.push(e.encode());
        }
        for d in &self.decides {
            leaves.push(d.encode());
        }
        for o in &self.orphaned {
            leaves.push(o.encode());
        }
        leaves
    }
}
