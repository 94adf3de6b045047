//! Typed facts of the replicated plan log.
//!
//! The log is a monotone, append-only set: facts are never mutated or
//! retracted, and the derived view is recomputed from the set alone, so any
//! two nodes holding the same facts agree regardless of arrival order.

use crate::primitives::{AgentId, ContentHash, NeedId, ProposalId, TaskId, ThreadId};
use crate::verb::ReconcileSummary;
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Task lifecycle state. The chain is totally ordered; merges take the
/// maximum, so state never regresses except through `INVALIDATE`, which
/// terminates the task rather than moving it backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Draft,
    Decided,
    Verified,
    Final,
}

/// A single typed fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Fact {
    /// Introduce a task node into the derived graph.
    AddTask {
        task: TaskId,
        task_type: String,
        requires: Vec<String>,
        produces: Vec<String>,
    },
    /// Declare an input artifact type for a task.
    Requires { task: TaskId, artifact_type: String },
    /// Bind a produced artifact (by CAS reference) to a task.
    Produces { task: TaskId, artifact: ContentHash },
    /// Directed edge in the derived graph. Cycle-creating links are rejected
    /// at ingress, never stored.
    Link { parent: TaskId, child: TaskId },
    /// Last-writer-wins annotation keyed by `(lamport, actor)`.
    Annotate {
        task: TaskId,
        key: String,
        val: String,
    },
    /// Task state assertion; merged by maximum over the state chain.
    State { task: TaskId, state: TaskState },
    /// Plan-consensus outcome for a need slot at an epoch.
    Decide {
        need: NeedId,
        proposal: ProposalId,
        epoch: u64,
    },
    /// Terminal acceptance of a task.
    Finalize { task: TaskId },
    /// Terminal rejection of a task.
    Invalidate { task: TaskId },
    /// Post-heal merge summary for a thread.
    Reconcile {
        thread: ThreadId,
        summary: ReconcileSummary,
    },
    /// Epoch summary over the derived view, enabling pruning.
    Checkpoint { epoch: u64, merkle_root: ContentHash },
}

/// A fact as it sits in the log: the fact itself plus the provenance needed
/// for deduplication and deterministic tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct FactRecord {
    /// Id of the envelope that carried this fact; the dedup key.
    pub envelope_id: ContentHash,
    /// Sender lamport stamp, first component of every tie-break.
    pub lamport: u64,
    /// Authoring agent, second component of every tie-break.
    pub actor: AgentId,
    pub fact: Fact,
}

impl FactRecord {
    /// The `(lamport, actor)` pair that totally orders concurrent writes.
    pub fn write_key(&self) -> (u64, AgentId) {
        (self.lamport, self.actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_chain_is_totally_ordered() {
        assert!(TaskState::Draft < TaskState::Decided);
        assert!(TaskState::Decided < TaskState::Verified);
        assert!(TaskState::Verified < TaskState::Final);
    }

    #[test]
    fn write_keys_break_ties_by_actor() {
        let a = FactRecord {
            envelope_id: ContentHash([1; 32]),
            lamport: 5,
            actor: AgentId([1; 32]),
            fact: Fact::Finalize {
                task: TaskId([0; 32]),
            },
        };
        let b = FactRecord {
            envelope_id: ContentHash([2; 32]),
            lamport: 5,
            actor: AgentId([2; 32]),
            fact: Fact::Finalize {
                task: TaskId([0; 32]),
            },
        };
        assert!(a.write_key() < b.write_key());
    }
}
