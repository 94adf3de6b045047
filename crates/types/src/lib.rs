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

//! Core data structures and error types for the Agora coordination kernel.
//!
//! Everything that crosses the bus or is hashed for signing is defined here,
//! together with the canonical codec that fixes its byte representation.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fact;
pub mod manifest;
pub mod primitives;
pub mod verb;

pub use envelope::{Capability, Envelope, Sender, UnsignedEnvelope};
pub use fact::{Fact, FactRecord, TaskState};
pub use primitives::{AgentId, ContentHash, NeedId, ProposalId, TaskId, ThreadId};
pub use verb::{ChallengeClass, ReconcileSummary, Verb, VerbKind, Verdict};
