//! Escrow rows.

use agora_types::{AgentId, TaskId};
use serde::{Deserialize, Serialize};

/// What an escrow row is locked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscrowId {
    /// A verify bounty escrowed at COMMIT publication.
    Bounty(TaskId),
    /// A challenger bond, keyed by the challenged task and the challenger.
    ChallengeBond(TaskId, AgentId),
}

/// Lifecycle of an escrow row. `Locked` is the only state releases accept;
/// the transition out of it happens exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    Locked,
    Released,
    Refunded,
}

/// One escrow row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRow {
    pub amount: u64,
    pub payer: AgentId,
    pub state: EscrowState,
}
