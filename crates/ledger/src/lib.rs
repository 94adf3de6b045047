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

//! The economic ledger.
//!
//! Accounts, stake, escrow rows, and the conservation law that binds them:
//! at every commit point, balances + stake + locked escrow + burned equals
//! everything ever minted. All arithmetic is checked, releases are
//! one-shot, and multi-step operations run inside an all-or-nothing
//! transaction boundary.

pub mod account;
pub mod escrow;
pub mod ledger;

pub use account::Account;
pub use escrow::{EscrowId, EscrowRow, EscrowState};
pub use ledger::{Ledger, MintOrder};
