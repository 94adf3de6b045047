//! The closed verb registry.
//!
//! Every externally invocable operation on the bus is one of these variants.
//! Dispatch is an exhaustive match; a tag outside the set fails canonical
//! decode and is dropped at ingress. Variants carry only the small
//! protocol-critical fields; bulk content travels as CAS references on the
//! envelope.

use crate::primitives::{ContentHash, NeedId, ProposalId, TaskId, ThreadId};
use crate::fact::Fact;
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A verifier's judgement of a committed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// The result satisfies its task contract.
    Pass,
    /// The result violates its task contract.
    Fail,
}

/// Typed challenge proof classes. Each class has a bounded verification cost
/// reflected in its weight, which scales the required challenger bond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeClass {
    /// Output does not conform to the task's declared output schema.
    SchemaViolation,
    /// A claimed citation hash is absent from the store or mismatched.
    MissingCitationHash,
    /// Output contradicts an input the task declared it consumed.
    SemanticContradiction,
    /// Execution exceeded the budgets bound in the policy capsule.
    BudgetOverrun,
    /// The result was computed against an input superseded before claim.
    StaleInput,
}

impl ChallengeClass {
    /// Bond multiplier for this class. Heavier verification costs demand
    /// larger bonds so frivolous challenges are not free.
    pub fn weight(&self) -> u64 {
        match self {
            Self::SchemaViolation => 1,
            Self::MissingCitationHash => 1,
            Self::BudgetOverrun => 2,
            Self::StaleInput => 2,
            Self::SemanticContradiction => 4,
        }
    }
}

/// Summary appended to the log after a partition heal merges two decision
/// histories for the same thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ReconcileSummary {
    /// The proposal whose decision survived the epoch comparison.
    pub winner: ProposalId,
    /// Epoch of the surviving decision.
    pub winner_epoch: u64,
    /// Proposals whose branches were tagged `orphaned_by_epoch`.
    pub orphaned: Vec<ProposalId>,
    /// Tasks from orphaned branches whose attested artifacts were reattached.
    pub salvaged: Vec<TaskId>,
}

/// The closed set of bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Verb {
    /// Request for work, opening a need slot at the given epoch.
    Need {
        need: NeedId,
        epoch: u64,
        /// Maximum total credits the requester will escrow for this need.
        budget: u64,
        /// Capability tag the work requires (router filter input).
        task_type: String,
    },
    /// A worker's bid: a plan subtree rooted at `proposal`.
    Propose {
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
        /// Asking price in credits.
        price: u64,
    },
    /// A verifier's vote for one proposal in a need slot.
    AttestPlan {
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
    },
    /// Quorum outcome for a need slot.
    Decide {
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
    },
    /// Batch of plan facts appended outside the bidding flow.
    UpdatePlan { facts: Vec<Fact> },
    /// Post-heal merge record for a thread.
    Reconcile {
        thread: ThreadId,
        summary: ReconcileSummary,
    },
    /// Take the lease on a decided task.
    Claim {
        need: NeedId,
        epoch: u64,
        task: TaskId,
        fencing_token: u64,
    },
    /// Voluntarily give the lease back without output.
    Yield {
        need: NeedId,
        epoch: u64,
        fencing_token: u64,
    },
    /// Release the lease (cancellation path).
    Release {
        need: NeedId,
        epoch: u64,
        fencing_token: u64,
    },
    /// Keep-alive for a held lease.
    Heartbeat {
        need: NeedId,
        epoch: u64,
        fencing_token: u64,
    },
    /// Publish the result of a leased task. Outputs ride in `content_refs`;
    /// `verify_bounty` is escrowed atomically with this message.
    Commit {
        need: NeedId,
        epoch: u64,
        task: TaskId,
        fencing_token: u64,
        verify_bounty: u64,
    },
    /// A verifier's judgement of a committed result, carrying its
    /// commit-gate policy digest for divergence detection.
    Attest {
        task: TaskId,
        verdict: Verdict,
        policy_eval_digest: ContentHash,
    },
    /// Terminal acceptance of a task after quorum + challenge window.
    Finalize { need: NeedId, task: TaskId },
    /// Typed objection to a committed or verified result.
    Challenge {
        task: TaskId,
        class: ChallengeClass,
        bond: u64,
    },
    /// Terminal rejection of a task (verifier-only).
    Invalidate { task: TaskId, reason: String },
    /// Epoch summary of the derived view, for pruning and fast sync.
    Checkpoint { epoch: u64, merkle_root: ContentHash },
    /// Surfaced policy or execution rejection of a prior envelope.
    Reject { subject: ContentHash, reason: String },
}

/// Discriminant-only mirror of [`Verb`], used by policy rules and metrics
/// labels where the payload is irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerbKind {
    Need,
    Propose,
    AttestPlan,
    Decide,
    UpdatePlan,
    Reconcile,
    Claim,
    Yield,
    Release,
    Heartbeat,
    Commit,
    Attest,
    Finalize,
    Challenge,
    Invalidate,
    Checkpoint,
    Reject,
}

impl Verb {
    /// The registry discriminant for this verb.
    pub fn kind(&self) -> VerbKind {
        match self {
            Verb::Need { .. } => VerbKind::Need,
            Verb::Propose { .. } => VerbKind::Propose,
            Verb::AttestPlan { .. } => VerbKind::AttestPlan,
            Verb::Decide { .. } => VerbKind::Decide,
            Verb::UpdatePlan { .. } => VerbKind::UpdatePlan,
            Verb::Reconcile { .. } => VerbKind::Reconcile,
            Verb::Claim { .. } => VerbKind::Claim,
            Verb::Yield { .. } => VerbKind::Yield,
            Verb::Release { .. } => VerbKind::Release,
            Verb::Heartbeat { .. } => VerbKind::Heartbeat,
            Verb::Commit { .. } => VerbKind::Commit,
            Verb::Attest { .. } => VerbKind::Attest,
            Verb::Finalize { .. } => VerbKind::Finalize,
            Verb::Challenge { .. } => VerbKind::Challenge,
            Verb::Invalidate { .. } => VerbKind::Invalidate,
            Verb::Checkpoint { .. } => VerbKind::Checkpoint,
            Verb::Reject { .. } => VerbKind::Reject,
        }
    }

    /// The bus capability under which this verb is published. Envelope
    /// verification rejects a verb published under the wrong capability.
    pub fn capability(&self) -> crate::envelope::Capability {
        use crate::envelope::Capability;
        match self.kind() {
            VerbKind::Need
            | VerbKind::Propose
            | VerbKind::AttestPlan
            | VerbKind::Decide
            | VerbKind::UpdatePlan
            | VerbKind::Reconcile => Capability::Planning,
            VerbKind::Claim
            | VerbKind::Yield
            | VerbKind::Release
            | VerbKind::Heartbeat
            | VerbKind::Commit
            | VerbKind::Attest
            | VerbKind::Finalize => Capability::Execution,
            VerbKind::Challenge
            | VerbKind::Invalidate
            | VerbKind::Checkpoint
            | VerbKind::Reject => Capability::Results,
        }
    }
}
