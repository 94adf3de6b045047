#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing
    )
)]

//! The replicated plan log.
//!
//! An append-only set of typed facts, deduplicated by envelope id, from
//! which every node derives the same task graph. All conflict resolution is
//! by deterministic total orders — `(lamport, actor)` for writes,
//! `(epoch, lamport, proposer)` for decisions, a max over the state chain —
//! so two nodes holding the same fact multiset agree bit-for-bit on the
//! derived view regardless of arrival order.

pub mod checkpoint;
pub mod log;
pub mod merkle;
pub mod view;

pub use checkpoint::{verify_snapshot, CheckpointTracker, StableCheckpoint};
pub use log::PlanLog;
pub use merkle::{merkle_proof, merkle_root, verify_proof, MerkleProof};
pub use view::{DecideRecord, DerivedView, TaskNode, ViewSnapshot};
