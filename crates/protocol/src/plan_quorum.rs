//! Scoped plan consensus.
//!
//! Verifiers vote ATTEST_PLAN for one proposal in a need slot; a proposal
//! that collects the effective plan quorum from distinct verifiers becomes
//! the slot's DECIDE. Votes are keyed by `(need, epoch)` so a retry under a
//! fresh epoch starts a clean tally.

use agora_types::error::NegotiationError;
use agora_types::{AgentId, NeedId, ProposalId};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Tallies plan attestations and reports quorum.
#[derive(Default)]
pub struct PlanQuorumTracker {
    /// (need, epoch) -> proposal -> distinct voters.
    votes: HashMap<(NeedId, u64), BTreeMap<ProposalId, HashSet<AgentId>>>,
    /// Slots already decided this epoch; late votes are no-ops.
    decided: HashSet<(NeedId, u64)>,
}

impl PlanQuorumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one vote. Returns the winning proposal if this vote
    /// completed the quorum. Duplicate votes from one verifier for the
    /// same proposal are rejected; a verifier may vote for at most one
    /// proposal per `(need, epoch)`.
    pub fn record_vote(
        &mut self,
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
        verifier: AgentId,
        k_plan: u32,
    ) -> Result<Option<ProposalId>, NegotiationError> {
        if self.decided.contains(&(need, epoch)) {
            debug!(target: "protocol", %need, epoch, "vote after decide ignored");
            return Ok(None);
        }
        let tally = self.votes.entry((need, epoch)).or_default();

        // One vote per verifier across all proposals in this slot/epoch.
        let already = tally
            .iter()
            .any(|(_, voters)| voters.contains(&verifier));
        if already {
            return Err(NegotiationError::DuplicateAttestation(verifier));
        }

        let voters = tally.entry(proposal).or_default();
        voters.insert(verifier);
        let count = voters.len() as u32;
        debug!(target: "protocol", %need, epoch, %proposal, count, k_plan, "plan vote recorded");

        if count >= k_plan {
            self.decided.insert((need, epoch));
            self.votes.retain(|(n, e), _| !(*n == need && *e == epoch));
            info!(target: "protocol", %need, epoch, %proposal, "plan quorum reached");
            return Ok(Some(proposal));
        }
        Ok(None)
    }

    /// Drops tallies for epochs below `min_epoch` of a need (post-heal
    /// housekeeping, mirrors slot epoch adoption).
    pub fn prune_below(&mut self, need: NeedId, min_epoch: u64) {
        self.votes
            .retain(|(n, e), _| !(*n == need && *e < min_epoch));
        self.decided
            .retain(|(n, e)| !(*n == need && *e < min_epoch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(b: u8) -> AgentId {
        AgentId([b; 32])
    }

    fn need() -> NeedId {
        NeedId([1; 32])
    }

    fn prop(b: u8) -> ProposalId {
        ProposalId([b; 32])
    }

    #[test]
    fn quorum_of_two_decides() {
        let mut t = PlanQuorumTracker::new();
        assert_eq!(
            t.record_vote(need(), 1, prop(1), agent(1), 2).unwrap(),
            None
        );
        assert_eq!(
            t.record_vote(need(), 1, prop(1), agent(2), 2).unwrap(),
            Some(prop(1))
        );
    }

    #[test]
    fn one_verifier_cannot_vote_twice() {
        let mut t = PlanQuorumTracker::new();
        t.record_vote(need(), 1, prop(1), agent(1), 3).unwrap();
        assert!(matches!(
            t.record_vote(need(), 1, prop(1), agent(1), 3),
            Err(NegotiationError::DuplicateAttestation(_))
        ));
        // Nor switch to a competing proposal.
        assert!(matches!(
            t.record_vote(need(), 1, prop(2), agent(1), 3),
            Err(NegotiationError::DuplicateAttestation(_))
        ));
    }

    #[test]
    fn votes_after_decide_are_ignored() {
        let mut t = PlanQuorumTracker::new();
        t.record_vote(need(), 1, prop(1), agent(1), 1).unwrap();
        assert_eq!(
            t.record_vote(need(), 1, prop(2), agent(2), 1).unwrap(),
            None
        );
    }

    #[test]
    fn epochs_tally_independently() {
        let mut t = PlanQuorumTracker::new();
        t.record_vote(need(), 1, prop(1), agent(1), 2).unwrap();
        // Same verifier, fresh epoch: allowed.
        assert_eq!(
            t.record_vote(need(), 2, prop(2), agent(1), 2).unwrap(),
            None
        );
        assert_eq!(
            t.record_vote(need(), 2, prop(2), agent(2), 2).unwrap(),
            Some(prop(2))
        );
    }

    #[test]
    fn competing_proposals_race_to_quorum() {
        let mut t = PlanQuorumTracker::new();
        t.record_vote(need(), 1, prop(1), agent(1), 2).unwrap();
        t.record_vote(need(), 1, prop(2), agent(2), 2).unwrap();
        assert_eq!(
            t.record_vote(need(), 1, prop(2), agent(3), 2).unwrap(),
            Some(prop(2))
        );
    }
}
