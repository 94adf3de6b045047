//! The typed challenge flow.
//!
//! Challenges are drawn from the fixed class registry, bonded in proportion
//! to their verification cost, and only valid inside the challenge window.
//! Resolution effects (slashing, bond return, reallocation) are described
//! to the caller; the ledger executes them.

use agora_types::error::NegotiationError;
use agora_types::{AgentId, ChallengeClass, TaskId};
use std::collections::HashMap;
use tracing::{info, warn};

/// An accepted, still-unresolved challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub task: TaskId,
    pub class: ChallengeClass,
    pub challenger: AgentId,
    pub bond: u64,
    pub posted_at: u64,
}

/// The verifier panel's ruling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// The objection holds: slash attestors, reallocate, invalidate, retry.
    Upheld,
    /// The objection fails: the challenger forfeits the bond.
    Rejected,
}

/// Tracks open and upheld challenges per task.
#[derive(Default)]
pub struct ChallengeManager {
    open: HashMap<TaskId, Vec<ChallengeRecord>>,
    upheld: HashMap<TaskId, ChallengeRecord>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a challenge.
    ///
    /// Window rule: a challenge stamped at `commit_ts + T - 1` is in
    /// window; at `commit_ts + T` it is late. Late or under-bonded
    /// challenges are rejected here and never tallied (the envelope still
    /// lands in the log for audit).
    pub fn post(
        &mut self,
        task: TaskId,
        class: ChallengeClass,
        challenger: AgentId,
        bond: u64,
        now_ms: u64,
        commit_ts: u64,
        t_challenge_ms: u64,
        base_bond: u64,
    ) -> Result<&ChallengeRecord, NegotiationError> {
        let closes_at = commit_ts.saturating_add(t_challenge_ms);
        if now_ms >= closes_at {
            return Err(NegotiationError::WindowClosed {
                closed_at: closes_at,
                got: now_ms,
            });
        }
        let required = base_bond.saturating_mul(class.weight());
        if bond < required {
            return Err(NegotiationError::ChallengeRejected(format!(
                "bond {} below required {} for {:?}",
                bond, required, class
            )));
        }
        let record = ChallengeRecord {
            task,
            class,
            challenger,
            bond,
            posted_at: now_ms,
        };
        info!(target: "protocol", %task, ?class, challenger = %challenger, bond, "challenge posted");
        let list = self.open.entry(task).or_default();
        list.push(record);
        Ok(list.last().unwrap_or_else(|| unreachable!()))
    }

    /// Applies the panel ruling for a specific open challenge.
    pub fn resolve(
        &mut self,
        task: &TaskId,
        challenger: &AgentId,
        outcome: ChallengeOutcome,
    ) -> Result<ChallengeRecord, NegotiationError> {
        let list = self
            .open
            .get_mut(task)
            .ok_or(NegotiationError::UnknownTask(*task))?;
        let idx = list
            .iter()
            .position(|r| r.challenger == *challenger)
            .ok_or_else(|| {
                NegotiationError::ChallengeRejected("no open challenge from sender".into())
            })?;
        let record = list.remove(idx);
        if list.is_empty() {
            self.open.remove(task);
        }
        match outcome {
            ChallengeOutcome::Upheld => {
                warn!(target: "protocol", %task, ?record.class, "challenge upheld");
                self.upheld.insert(*task, record.clone());
            }
            ChallengeOutcome::Rejected => {
                info!(target: "protocol", %task, "challenge rejected, bond forfeited");
            }
        }
        Ok(record)
    }

    pub fn has_open(&self, task: &TaskId) -> bool {
        self.open.contains_key(task)
    }

    pub fn has_upheld(&self, task: &TaskId) -> bool {
        self.upheld.contains_key(task)
    }

    /// Clears the upheld mark when the task retries under a bumped quorum.
    pub fn clear_upheld(&mut self, task: &TaskId) {
        self.upheld.remove(task);
    }
}
