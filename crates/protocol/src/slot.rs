//! The per-need negotiation state machine.
//!
//! One slot per need id. Every mutating verb is validated against the
//! slot's epoch, phase, and (where a lease is involved) fencing token
//! before it changes anything; a stale epoch is rejected outright.

use crate::lease::Lease;
use agora_types::error::NegotiationError;
use agora_types::{AgentId, NeedId, ProposalId, TaskId};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Collecting proposals until the bid window closes.
    Bidding,
    /// A proposal won the plan quorum; the task is claimable.
    Decided,
    /// A worker holds the lease.
    Leased,
    /// Output published; challenge window running.
    Committed,
    /// Result quorum met; waiting out the challenge window.
    Verified,
    /// Terminal acceptance.
    Final,
}

/// A recorded bid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalBid {
    pub proposer: AgentId,
    pub price: u64,
    pub lamport: u64,
}

/// The slot itself.
#[derive(Debug, Clone)]
pub struct NeedSlot {
    pub need: NeedId,
    pub epoch: u64,
    pub budget: u64,
    pub task_type: String,
    phase: SlotPhase,
    /// Bids collected this epoch.
    pub proposals: BTreeMap<ProposalId, ProposalBid>,
    /// Winning proposal once decided.
    pub decided: Option<ProposalId>,
    lease: Option<Lease>,
    fencing_counter: u64,
    /// When the current bid window closes.
    pub bid_window_closes_at: u64,
    /// Set at COMMIT; anchors the challenge window.
    pub commit_ts: Option<u64>,
    /// Extra result attestations demanded after upheld challenges.
    pub k_result_bump: u32,
    /// PROPOSE retries attempted for this need (backoff input).
    pub retry_attempts: u32,
}

impl NeedSlot {
    /// Opens a slot for a fresh NEED.
    pub fn open(
        need: NeedId,
        epoch: u64,
        budget: u64,
        task_type: String,
        now_ms: u64,
        bid_window_ms: u64,
    ) -> Self {
        info!(target: "protocol", %need, epoch, budget, "need slot opened");
        Self {
            need,
            epoch,
            budget,
            task_type,
            phase: SlotPhase::Bidding,
            proposals: BTreeMap::new(),
            decided: None,
            lease: None,
            fencing_counter: 0,
            bid_window_closes_at: now_ms.saturating_add(bid_window_ms),
            commit_ts: None,
            k_result_bump: 0,
            retry_attempts: 0,
        }
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// The task a worker claims: the decided proposal's root.
    pub fn decided_task(&self) -> Option<TaskId> {
        self.decided.map(|p| p.root_task())
    }

    fn check_epoch(&self, got: u64) -> Result<(), NegotiationError> {
        if got < self.epoch {
            return Err(NegotiationError::StaleEpoch {
                need: self.need,
                current: self.epoch,
                got,
            });
        }
        Ok(())
    }

    fn check_fencing(&self, sender: &AgentId, token: u64) -> Result<(), NegotiationError> {
        let lease = self.lease.as_ref().ok_or(NegotiationError::NotLeaseHolder)?;
        if lease.holder != *sender {
            return Err(NegotiationError::NotLeaseHolder);
        }
        if lease.fencing_token != token {
            return Err(NegotiationError::FencingMismatch {
                expected: lease.fencing_token,
                got: token,
            });
        }
        Ok(())
    }

    /// Records a bid. Late proposals are accepted into the log for audit
    /// but have no effect on the decision; this returns `WindowClosed` so
    /// the caller knows not to tally them.
    pub fn on_propose(
        &mut self,
        proposal: ProposalId,
        proposer: AgentId,
        price: u64,
        lamport: u64,
        epoch: u64,
        now_ms: u64,
    ) -> Result<(), NegotiationError> {
        self.check_epoch(epoch)?;
        if self.phase != SlotPhase::Bidding {
            return Err(NegotiationError::InvalidTransition {
                verb: "PROPOSE",
                phase: self.phase_name(),
            });
        }
        if now_ms >= self.bid_window_closes_at {
            return Err(NegotiationError::WindowClosed {
                closed_at: self.bid_window_closes_at,
                got: now_ms,
            });
        }
        self.proposals.insert(
            proposal,
            ProposalBid {
                proposer,
                price,
                lamport,
            },
        );
        Ok(())
    }

    /// Closes the bid window. With no proposals the slot re-opens under a
    /// fresh epoch; the caller schedules the retry NEED with backoff.
    pub fn close_bid_window(&mut self, now_ms: u64, bid_window_ms: u64) -> BidWindowOutcome {
        if self.phase != SlotPhase::Bidding || now_ms < self.bid_window_closes_at {
            return BidWindowOutcome::NotDue;
        }
        if self.proposals.is_empty() {
            self.epoch += 1;
            self.retry_attempts += 1;
            self.bid_window_closes_at = now_ms.saturating_add(bid_window_ms);
            debug!(target: "protocol", need = %self.need, epoch = self.epoch, "bid window empty, retrying");
            return BidWindowOutcome::Retry {
                new_epoch: self.epoch,
                attempt: self.retry_attempts,
            };
        }
        BidWindowOutcome::ReadyForQuorum
    }

    /// Applies a DECIDE (locally computed or received). A higher-epoch
    /// decision supersedes anything earlier, including an active lease.
    pub fn on_decide(&mut self, proposal: ProposalId, epoch: u64) -> Result<(), NegotiationError> {
        self.check_epoch(epoch)?;
        if epoch > self.epoch {
            // Epoch raced ahead of us (partition heal); adopt it.
            self.epoch = epoch;
            self.lease = None;
            self.commit_ts = None;
        }
        self.decided = Some(proposal);
        self.phase = SlotPhase::Decided;
        info!(target: "protocol", need = %self.need, %proposal, epoch, "slot decided");
        Ok(())
    }

    /// Grants the lease to a claimant.
    pub fn on_claim(
        &mut self,
        sender: AgentId,
        task: TaskId,
        epoch: u64,
        now_ms: u64,
        lease_ttl_ms: u64,
    ) -> Result<Lease, NegotiationError> {
        self.check_epoch(epoch)?;
        if self.phase != SlotPhase::Decided {
            return Err(NegotiationError::InvalidTransition {
                verb: "CLAIM",
                phase: self.phase_name(),
            });
        }
        match self.decided_task() {
            Some(expected) if expected == task => {}
            _ => return Err(NegotiationError::UnknownTask(task)),
        }
        if let Some(lease) = &self.lease {
            if !lease.is_expired(now_ms) {
                return Err(NegotiationError::LeaseHeld {
                    holder: lease.holder,
                });
            }
        }
        self.fencing_counter += 1;
        let lease = Lease {
            holder: sender,
            fencing_token: self.fencing_counter,
            expires_at: now_ms.saturating_add(lease_ttl_ms),
        };
        info!(
            target: "protocol",
            need = %self.need,
            holder = %sender,
            token = lease.fencing_token,
            "lease granted"
        );
        self.lease = Some(lease.clone());
        self.phase = SlotPhase::Leased;
        Ok(lease)
    }

    /// Renews the lease on a valid heartbeat.
    pub fn on_heartbeat(
        &mut self,
        sender: AgentId,
        epoch: u64,
        fencing_token: u64,
        now_ms: u64,
        lease_ttl_ms: u64,
    ) -> Result<(), NegotiationError> {
        self.check_epoch(epoch)?;
        self.check_fencing(&sender, fencing_token)?;
        if let Some(lease) = &mut self.lease {
            if lease.is_expired(now_ms) {
                return Err(NegotiationError::NotLeaseHolder);
            }
            lease.renew(now_ms, lease_ttl_ms);
        }
        Ok(())
    }

    /// YIELD/RELEASE: the holder hands the task back.
    pub fn on_release(
        &mut self,
        sender: AgentId,
        epoch: u64,
        fencing_token: u64,
    ) -> Result<(), NegotiationError> {
        self.check_epoch(epoch)?;
        self.check_fencing(&sender, fencing_token)?;
        self.lease = None;
        self.phase = SlotPhase::Decided;
        debug!(target: "protocol", need = %self.need, "lease released");
        Ok(())
    }

    /// Scavenges an expired lease back to DECIDED. Returns true if a lease
    /// was actually reclaimed.
    pub fn scavenge(&mut self, now_ms: u64) -> bool {
        let expired = self
            .lease
            .as_ref()
            .is_some_and(|l| l.is_expired(now_ms) && self.phase == SlotPhase::Leased);
        if expired {
            info!(target: "protocol", need = %self.need, "lease expired, scavenged");
            self.lease = None;
            self.phase = SlotPhase::Decided;
        }
        expired
    }

    /// COMMIT from the lease holder: output published, window starts.
    pub fn on_commit(
        &mut self,
        sender: AgentId,
        epoch: u64,
        fencing_token: u64,
        now_ms: u64,
    ) -> Result<(), NegotiationError> {
        self.check_epoch(epoch)?;
        self.check_fencing(&sender, fencing_token)?;
        if self.phase != SlotPhase::Leased {
            return Err(NegotiationError::InvalidTransition {
                verb: "COMMIT",
                phase: self.phase_name(),
            });
        }
        self.phase = SlotPhase::Committed;
        self.commit_ts = Some(now_ms);
        info!(target: "protocol", need = %self.need, commit_ts = now_ms, "commit recorded");
        Ok(())
    }

    /// Result quorum reached.
    pub fn on_verified(&mut self) -> Result<(), NegotiationError> {
        if self.phase != SlotPhase::Committed {
            return Err(NegotiationError::InvalidTransition {
                verb: "ATTEST-quorum",
                phase: self.phase_name(),
            });
        }
        self.phase = SlotPhase::Verified;
        Ok(())
    }

    /// Whether FINALIZE is admissible now: verified, the full challenge
    /// window elapsed, and no upheld challenge.
    pub fn finalize_ready(&self, now_ms: u64, t_challenge_ms: u64, upheld_challenge: bool) -> bool {
        if self.phase != SlotPhase::Verified || upheld_challenge {
            return false;
        }
        self.commit_ts
            .is_some_and(|ts| now_ms >= ts.saturating_add(t_challenge_ms))
    }

    /// Marks the slot FINAL.
    pub fn on_finalize(&mut self) -> Result<(), NegotiationError> {
        if self.phase != SlotPhase::Verified {
            return Err(NegotiationError::InvalidTransition {
                verb: "FINALIZE",
                phase: self.phase_name(),
            });
        }
        self.phase = SlotPhase::Final;
        info!(target: "protocol", need = %self.need, "slot final");
        Ok(())
    }

    /// Reopens after an upheld challenge: back to DECIDED with a larger
    /// result quorum and no lease or commit.
    pub fn reopen(&mut self, k_result_increment: u32) {
        self.k_result_bump += k_result_increment;
        self.lease = None;
        self.commit_ts = None;
        self.phase = SlotPhase::Decided;
        info!(
            target: "protocol",
            need = %self.need,
            bump = self.k_result_bump,
            "slot reopened after upheld challenge"
        );
    }

    fn phase_name(&self) -> &'static str {
        match self.phase {
            SlotPhase::Bidding => "BIDDING",
            SlotPhase::Decided => "DECIDED",
            SlotPhase::Leased => "LEASED",
            SlotPhase::Committed => "COMMITTED",
            SlotPhase::Verified => "VERIFIED",
            SlotPhase::Final => "FINAL",
        }
    }
}

/// Outcome of a bid-window close check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidWindowOutcome {
    /// Window still open or slot past bidding.
    NotDue,
    /// No proposals arrived; retry under the new epoch with backoff.
    Retry { new_epoch: u64, attempt: u32 },
    /// Proposals collected; run the plan quorum.
    ReadyForQuorum,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(b: u8) -> AgentId {
        AgentId([b; 32])
    }

    fn slot() -> NeedSlot {
        NeedSlot::open(NeedId([1; 32]), 1, 100, "summarize".into(), 0, 1_000)
    }

    fn decided_slot() -> NeedSlot {
        let mut s = slot();
        s.on_propose(ProposalId([2; 32]), agent(2), 10, 1, 1, 100)
            .unwrap();
        s.on_decide(ProposalId([2; 32]), 1).unwrap();
        s
    }

    #[test]
    fn propose_after_window_close_is_rejected() {
        let mut s = slot();
        assert!(s
            .on_propose(ProposalId([2; 32]), agent(2), 10, 1, 1, 999)
            .is_ok());
        assert!(matches!(
            s.on_propose(ProposalId([3; 32]), agent(3), 10, 2, 1, 1_000),
            Err(NegotiationError::WindowClosed { .. })
        ));
    }

    #[test]
    fn stale_epoch_is_rejected() {
        let mut s = decided_slot();
        s.on_decide(ProposalId([2; 32]), 3).unwrap();
        assert!(matches!(
            s.on_claim(agent(2), ProposalId([2; 32]).root_task(), 2, 0, 100),
            Err(NegotiationError::StaleEpoch { .. })
        ));
    }

    #[test]
    fn empty_window_retries_with_new_epoch() {
        let mut s = slot();
        assert_eq!(s.close_bid_window(500, 1_000), BidWindowOutcome::NotDue);
        assert_eq!(
            s.close_bid_window(1_000, 1_000),
            BidWindowOutcome::Retry {
                new_epoch: 2,
                attempt: 1
            }
        );
    }

    #[test]
    fn claim_grants_a_fenced_lease() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        let lease = s.on_claim(agent(2), task, 1, 1_000, 30_000).unwrap();
        assert_eq!(lease.fencing_token, 1);
        assert_eq!(lease.expires_at, 31_000);
        assert!(matches!(
            s.on_claim(agent(3), task, 1, 2_000, 30_000),
            Err(NegotiationError::LeaseHeld { .. })
        ));
    }

    #[test]
    fn expired_lease_can_be_reclaimed_with_new_token() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 1_000).unwrap();
        assert!(s.scavenge(1_000));
        assert_eq!(s.phase(), SlotPhase::Decided);
        let lease = s.on_claim(agent(3), task, 1, 1_500, 1_000).unwrap();
        assert_eq!(lease.fencing_token, 2);
        assert_eq!(lease.holder, agent(3));
    }

    #[test]
    fn heartbeat_renews_only_for_the_holder_with_the_right_token() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 1_000).unwrap();
        assert!(matches!(
            s.on_heartbeat(agent(3), 1, 1, 500, 1_000),
            Err(NegotiationError::NotLeaseHolder)
        ));
        assert!(matches!(
            s.on_heartbeat(agent(2), 1, 7, 500, 1_000),
            Err(NegotiationError::FencingMismatch { .. })
        ));
        s.on_heartbeat(agent(2), 1, 1, 500, 1_000).unwrap();
        assert_eq!(s.lease().unwrap().expires_at, 1_500);
    }

    #[test]
    fn commit_then_verify_then_finalize_after_window() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 10_000).unwrap();
        s.on_commit(agent(2), 1, 1, 2_000).unwrap();
        s.on_verified().unwrap();

        // Window: commit at 2000 + 60_000.
        assert!(!s.finalize_ready(61_999, 60_000, false));
        assert!(s.finalize_ready(62_000, 60_000, false));
        assert!(!s.finalize_ready(62_000, 60_000, true));
        s.on_finalize().unwrap();
        assert_eq!(s.phase(), SlotPhase::Final);
    }

    #[test]
    fn release_returns_the_slot_to_decided() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 10_000).unwrap();
        s.on_release(agent(2), 1, 1).unwrap();
        assert_eq!(s.phase(), SlotPhase::Decided);
        assert!(s.lease().is_none());
    }

    #[test]
    fn reopen_bumps_the_result_quorum_and_clears_execution_state() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 10_000).unwrap();
        s.on_commit(agent(2), 1, 1, 100).unwrap();
        s.on_verified().unwrap();
        s.reopen(2);
        assert_eq!(s.phase(), SlotPhase::Decided);
        assert_eq!(s.k_result_bump, 2);
        assert!(s.lease().is_none());
        assert!(s.commit_ts.is_none());
    }

    #[test]
    fn higher_epoch_decide_supersedes_a_lease() {
        let mut s = decided_slot();
        let task = s.decided_task().unwrap();
        s.on_claim(agent(2), task, 1, 0, 10_000).unwrap();
        s.on_decide(ProposalId([9; 32]), 2).unwrap();
        assert_eq!(s.epoch, 2);
        assert!(s.lease().is_none());
        assert_eq!(s.decided, Some(ProposalId([9; 32])));
    }
}
