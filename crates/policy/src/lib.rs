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

//! Policy capsules and their evaluator.
//!
//! A capsule is a signed, non-Turing-complete rule program plus budgets and
//! economic knobs, bound to a specific evaluator build by `engine_hash`.
//! Evaluation is pure and gas-metered: two nodes holding the same capsule
//! and inputs always produce the same decision and the same digest. The
//! evaluator runs at three gates — preflight, ingress, and commit — and a
//! digest disagreement between verifiers quarantines the capsule.

pub mod capsule;
pub mod engine;
pub mod gates;
pub mod inputs;
pub mod program;

pub use capsule::{Budgets, ChallengeSplit, PolicyCapsule};
pub use engine::{engine_hash, Decision, Evaluator};
pub use gates::{Gate, GateKeeper};
pub use inputs::EvalInputs;
pub use program::{DefaultVerdict, PolicyRule, RuleConditions, RuleVerdict};
