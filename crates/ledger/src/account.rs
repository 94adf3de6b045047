//! Account rows.

use serde::{Deserialize, Serialize};

/// One participant's economic standing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Spendable credits.
    pub balance: u64,
    /// Credits bonded as stake; slashable.
    pub stake: u64,
    /// Router input; moved by attestation outcomes, not by transfers.
    pub reputation: f32,
}

impl Account {
    /// Total credits attributable to this account.
    pub fn wealth(&self) -> u64 {
        self.balance.saturating_add(self.stake)
    }
}
