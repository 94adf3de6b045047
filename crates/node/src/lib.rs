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

//! The Agora node.
//!
//! Wires the kernel components into a running participant: envelopes come
//! off the bus, pass signature and lamport verification on a bounded
//! worker stage, clear the ingress policy gate, and are applied through a
//! single-writer queue that feeds the plan log and the negotiation state
//! machines. Timers drive bid windows, lease scavenging, challenge
//! windows, and checkpoint emission through the same state, so tests can
//! step time by hand.

pub mod local_bus;
pub mod node;
pub mod state;

pub use local_bus::MemoryBus;
pub use node::{Node, NodeRole};
pub use state::{IngestError, KernelState, Outbound};
