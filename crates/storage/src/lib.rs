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

//! Crash-safe persistence for the Agora node.
//!
//! Three concerns: the append-only fact WAL that lets the plan log recover
//! after a crash, the batched lamport clock store, and the stable
//! checkpoint store. Every write path ends in an fsync or an atomic
//! rename; a torn tail is detected and truncated at recovery, never
//! silently replayed.

pub mod checkpoint_store;
pub mod clock_store;
pub mod ledger_store;
pub mod wal;

pub use checkpoint_store::CheckpointStore;
pub use clock_store::LamportClockStore;
pub use ledger_store::LedgerStore;
pub use wal::{FactWal, WalIterator};
