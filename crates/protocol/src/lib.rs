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

//! The negotiation protocol.
//!
//! Per-need slot state machines with leases, epochs, and fencing tokens;
//! the scoped plan quorum that turns proposals into decisions; the result
//! quorum with digest-divergence detection; and the typed challenge flow.
//! Everything here is pure state-machine logic over timestamps supplied by
//! the caller — the node wires in the bus, the ledger, and real clocks.

pub mod backoff;
pub mod challenge;
pub mod lease;
pub mod plan_quorum;
pub mod result_quorum;
pub mod slot;

pub use backoff::retry_delay_ms;
pub use challenge::{ChallengeManager, ChallengeOutcome, ChallengeRecord};
pub use lease::Lease;
pub use plan_quorum::PlanQuorumTracker;
pub use result_quorum::{AttestOutcome, ResultQuorumTracker};
pub use slot::{NeedSlot, SlotPhase};
