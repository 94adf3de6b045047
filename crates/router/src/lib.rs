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

//! Committee selection and work routing.
//!
//! The pipeline is filter → shortlist → canary → bandit: declared
//! capability and budget prune the field, a weighted score ranks it,
//! the top pair runs a scored micro-task, and a per-domain bandit with a
//! mandatory newcomer exploration floor balances exploitation against
//! discovering new talent. Committees are additionally bound by hard
//! per-entity diversity caps, and identities only enter the candidate set
//! through staked or proof-of-work-bound admission.

pub mod bandit;
pub mod selection;
pub mod sybil;

pub use bandit::DomainBandit;
pub use selection::{CanaryPair, RouterConfig, ScoreWeights, Selector};
pub use sybil::{AdmissionPolicy, AdmissionProof};

/// Routing failures.
#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    /// The filter left fewer candidates than the committee needs.
    #[error("Not enough candidates: need {need}, have {have}")]
    InsufficientCandidates { need: usize, have: usize },
    /// No committee satisfying the diversity caps exists in the shortlist.
    #[error("Diversity caps cannot be satisfied: {0}")]
    DiversityUnsatisfiable(String),
    /// Identity admission refused.
    #[error("Admission refused: {0}")]
    AdmissionRefused(String),
}
