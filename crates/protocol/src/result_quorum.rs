//! Result quorum with commit-gate digest comparison.
//!
//! Verifiers post ATTEST with a verdict and the digest of their commit-gate
//! policy evaluation. Distinct verifiers must agree on that digest; a
//! disagreement is cryptographic evidence that policy evaluation diverged
//! somewhere and freezes the task via capsule quarantine.

use agora_types::error::{IntegrityError, NegotiationError};
use agora_types::{AgentId, ContentHash, TaskId, Verdict};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// One verifier's recorded attestation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttestRecord {
    verdict: Verdict,
    digest: ContentHash,
}

/// What recording an attestation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestOutcome {
    /// Recorded; quorum not yet met.
    Pending { passes: u32 },
    /// This attestation completed the pass quorum.
    QuorumReached { passes: u32 },
    /// Digest disagreement between verifiers; fatal integrity event.
    Divergence(IntegrityError),
}

/// Tallies result attestations per task.
#[derive(Default)]
pub struct ResultQuorumTracker {
    attests: HashMap<TaskId, BTreeMap<AgentId, AttestRecord>>,
    /// Tasks whose quorum already fired (verified); later passes no-op.
    verified: HashMap<TaskId, u32>,
}

impl ResultQuorumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one attestation from a distinct verifier.
    pub fn record(
        &mut self,
        task: TaskId,
        verifier: AgentId,
        verdict: Verdict,
        digest: ContentHash,
        k_result: u32,
    ) -> Result<AttestOutcome, NegotiationError> {
        let records = self.attests.entry(task).or_default();
        if records.contains_key(&verifier) {
            return Err(NegotiationError::DuplicateAttestation(verifier));
        }

        // Commit-gate determinism check: every verifier of this task must
        // have evaluated the same inputs to the same digest.
        if let Some((_, existing)) = records.iter().next() {
            if existing.digest != digest {
                warn!(
                    target: "protocol",
                    %task,
                    left = %existing.digest,
                    right = %digest,
                    "policy digest divergence between verifiers"
                );
                return Ok(AttestOutcome::Divergence(
                    IntegrityError::DigestDivergence {
                        task,
                        left: existing.digest,
                        right: digest,
                    },
                ));
            }
        }

        records.insert(verifier, AttestRecord { verdict, digest });
        let passes = records
            .values()
            .filter(|r| r.verdict == Verdict::Pass)
            .count() as u32;
        debug!(target: "protocol", %task, passes, k_result, "attest recorded");

        if passes >= k_result && !self.verified.contains_key(&task) {
            self.verified.insert(task, passes);
            return Ok(AttestOutcome::QuorumReached { passes });
        }
        Ok(AttestOutcome::Pending { passes })
    }

    /// Verifiers that attested pass for a task (slashing set on upheld
    /// challenges).
    pub fn pass_attestors(&self, task: &TaskId) -> Vec<AgentId> {
        self.attests
            .get(task)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, r)| r.verdict == Verdict::Pass)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct pass count so far.
    pub fn passes(&self, task: &TaskId) -> u32 {
        self.attests
            .get(task)
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.verdict == Verdict::Pass)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Clears a task's tally (reopen after upheld challenge: the retry
    /// needs fresh attestations).
    pub fn reset_task(&mut self, task: &TaskId) {
        self.attests.remove(task);
        self.verified.remove(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(b: u8) -> AgentId {
        AgentId([b; 32])
    }

    fn task() -> TaskId {
        TaskId([5; 32])
    }

    fn digest(b: u8) -> ContentHash {
        ContentHash([b; 32])
    }

    #[test]
    fn three_passes_reach_quorum() {
        let mut t = ResultQuorumTracker::new();
        assert_eq!(
            t.record(task(), agent(1), Verdict::Pass, digest(1), 3).unwrap(),
            AttestOutcome::Pending { passes: 1 }
        );
        assert_eq!(
            t.record(task(), agent(2), Verdict::Pass, digest(1), 3).unwrap(),
            AttestOutcome::Pending { passes: 2 }
        );
        assert_eq!(
            t.record(task(), agent(3), Verdict::Pass, digest(1), 3).unwrap(),
            AttestOutcome::QuorumReached { passes: 3 }
        );
    }

    #[test]
    fn fails_do_not_count_toward_the_quorum() {
        let mut t = ResultQuorumTracker::new();
        t.record(task(), agent(1), Verdict::Fail, digest(1), 2).unwrap();
        let out = t.record(task(), agent(2), Verdict::Pass, digest(1), 2).unwrap();
        assert_eq!(out, AttestOutcome::Pending { passes: 1 });
    }

    #[test]
    fn duplicate_verifier_is_rejected() {
        let mut t = ResultQuorumTracker::new();
        t.record(task(), agent(1), Verdict::Pass, digest(1), 3).unwrap();
        assert!(matches!(
            t.record(task(), agent(1), Verdict::Pass, digest(1), 3),
            Err(NegotiationError::DuplicateAttestation(_))
        ));
    }

    #[test]
    fn divergent_digest_raises_integrity_event() {
        let mut t = ResultQuorumTracker::new();
        t.record(task(), agent(1), Verdict::Pass, digest(1), 3).unwrap();
        let out = t.record(task(), agent(2), Verdict::Pass, digest(2), 3).unwrap();
        assert!(matches!(
            out,
            AttestOutcome::Divergence(IntegrityError::DigestDivergence { .. })
        ));
        // The divergent attestation is not tallied.
        assert_eq!(t.passes(&task()), 1);
    }

    #[test]
    fn reset_clears_the_tally_for_a_retry() {
        let mut t = ResultQuorumTracker::new();
        t.record(task(), agent(1), Verdict::Pass, digest(1), 1).unwrap();
        t.reset_task(&task());
        assert_eq!(t.passes(&task()), 0);
        // Same verifier may attest again on the retry.
        assert!(t.record(task(), agent(1), Verdict::Pass, digest(3), 1).is_ok());
    }

    #[test]
    fn pass_attestors_lists_only_passers() {
        let mut t = ResultQuorumTracker::new();
        t.record(task(), agent(1), Verdict::Pass, digest(1), 5).unwrap();
        t.record(task(), agent(2), Verdict::Fail, digest(1), 5).unwrap();
        assert_eq!(t.pass_attestors(&task()), vec![agent(1)]);
    }
}
