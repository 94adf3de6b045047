//! The kernel state machine.
//!
//! Everything that must be identical across nodes lives here, behind a
//! synchronous API: `ingest` runs the full pipeline for one verified-order
//! envelope, `tick` runs the timers. Both return [`Outbound`] intents —
//! messages this node should now publish — so the async layer stays a thin
//! shell and tests can drive the whole protocol deterministically.

use agora_crypto::verify_envelope;
use agora_ledger::{EscrowId, Ledger};
use agora_plan::{CheckpointTracker, PlanLog, StableCheckpoint};
use agora_policy::{Decision, EvalInputs, Gate, GateKeeper, PolicyCapsule};
use agora_protocol::{
    retry_delay_ms, AttestOutcome, ChallengeManager, ChallengeOutcome, NeedSlot,
    PlanQuorumTracker, ResultQuorumTracker, SlotPhase,
};
use agora_types::error::{
    ErrorCode, IntegrityError, LedgerError, NegotiationError, PolicyError, ProtocolError,
};
use agora_types::verb::ReconcileSummary;
use agora_types::{
    AgentId, ChallengeClass, ContentHash, Envelope, Fact, FactRecord, NeedId, ProposalId, TaskId,
    TaskState, ThreadId, Verb, Verdict,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

/// How many extra result attestations an upheld challenge demands.
const K_RESULT_BUMP_ON_REOPEN: u32 = 2;
/// Reputation moves applied at finalize and slash time.
const REPUTATION_REWARD: f32 = 0.1;
const REPUTATION_PENALTY: f32 = 0.5;
/// Stake fraction slashed per unit of challenge class weight, in bps.
const SLASH_BPS_PER_WEIGHT: u64 = 1_000;

/// A message this node should seal and publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Decide {
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
    },
    Reconcile {
        thread: ThreadId,
        summary: ReconcileSummary,
    },
    Finalize {
        need: NeedId,
        task: TaskId,
    },
    Invalidate {
        task: TaskId,
        reason: String,
    },
    Checkpoint {
        epoch: u64,
        merkle_root: ContentHash,
    },
    Reject {
        subject: ContentHash,
        reason: String,
    },
    /// Re-publish a NEED under a fresh epoch after an empty bid window,
    /// delayed by randomized backoff.
    NeedRetry {
        need: NeedId,
        epoch: u64,
        budget: u64,
        task_type: String,
        delay_ms: u64,
    },
}

/// Why an envelope did not take effect.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl IngestError {
    /// The stable code used for audit logs and REJECT reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::Policy(e) => e.code(),
            Self::Negotiation(e) => e.code(),
            Self::Ledger(e) => e.code(),
            Self::Integrity(e) => e.code(),
        }
    }

    /// Protocol and integrity faults are dropped locally; everything else
    /// is surfaced to the sender as a typed REJECT.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, Self::Protocol(_) | Self::Integrity(_))
    }
}

struct CommitInfo {
    need: NeedId,
    committer: AgentId,
    output_refs: Vec<ContentHash>,
    capsule_hash: ContentHash,
    /// The committer's own timestamp, from the COMMIT envelope. Commit-gate
    /// telemetry derives from envelope data only, so every verifier
    /// evaluates identical inputs.
    sender_timestamp: u64,
}

/// The replicated-state kernel of one node.
pub struct KernelState {
    config: agora_types::config::KernelConfig,
    self_id: AgentId,
    /// Whether this node carries the verifier capability.
    verifier: bool,
    /// Known verifier roster (genesis plus admissions).
    verifiers: BTreeSet<AgentId>,
    plan: PlanLog,
    slots: HashMap<NeedId, NeedSlot>,
    plan_quorum: PlanQuorumTracker,
    result_quorum: ResultQuorumTracker,
    challenges: ChallengeManager,
    checkpoints: CheckpointTracker,
    pub ledger: Ledger,
    gatekeeper: GateKeeper,
    capsules: HashMap<ContentHash, PolicyCapsule>,
    /// Per-sender lamport floors.
    last_seen: HashMap<AgentId, u64>,
    lamport: u64,
    /// Per-thread message counts, policy budget telemetry.
    thread_msgs: HashMap<ThreadId, u64>,
    commits: HashMap<TaskId, CommitInfo>,
    task_needs: HashMap<TaskId, NeedId>,
    /// Who opened each need; only they retry it.
    requesters: HashMap<NeedId, AgentId>,
    /// Requester-stamped open time per need, ttl telemetry baseline.
    need_opened: HashMap<NeedId, u64>,
    /// Epoch counter for checkpoint emission.
    next_checkpoint_epoch: u64,
    records_at_last_checkpoint: u64,
    last_checkpoint_emitted_at: u64,
    /// Bootstrap-exit tracking.
    bootstrap_observations: u32,
    finalized_jobs: u64,
    rng: StdRng,
}

impl KernelState {
    pub fn new(
        config: agora_types::config::KernelConfig,
        self_id: AgentId,
        verifier: bool,
        verifiers: BTreeSet<AgentId>,
        ledger: Ledger,
    ) -> Self {
        Self {
            config,
            self_id,
            verifier,
            verifiers,
            plan: PlanLog::new(),
            slots: HashMap::new(),
            plan_quorum: PlanQuorumTracker::new(),
            result_quorum: ResultQuorumTracker::new(),
            challenges: ChallengeManager::new(),
            checkpoints: CheckpointTracker::new(),
            ledger,
            gatekeeper: GateKeeper::new(),
            capsules: HashMap::new(),
            last_seen: HashMap::new(),
            lamport: 0,
            thread_msgs: HashMap::new(),
            commits: HashMap::new(),
            task_needs: HashMap::new(),
            requesters: HashMap::new(),
            need_opened: HashMap::new(),
            next_checkpoint_epoch: 1,
            records_at_last_checkpoint: 0,
            last_checkpoint_emitted_at: 0,
            bootstrap_observations: 0,
            finalized_jobs: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic retry jitter for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.set_rng_seed(seed);
        self
    }

    /// In-place variant of [`KernelState::with_rng_seed`].
    pub fn set_rng_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Restores the lamport clock after a restart (persisted + margin).
    pub fn resume_lamport(&mut self, floor: u64) {
        self.lamport = self.lamport.max(floor);
    }

    pub fn self_id(&self) -> AgentId {
        self.self_id
    }

    pub fn is_verifier(&self) -> bool {
        self.verifier
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    pub fn plan(&self) -> &PlanLog {
        &self.plan
    }

    pub fn slot(&self, need: &NeedId) -> Option<&NeedSlot> {
        self.slots.get(need)
    }

    pub fn gatekeeper(&self) -> &GateKeeper {
        &self.gatekeeper
    }

    /// Installs a validated capsule so envelopes may reference it.
    pub fn install_capsule(&mut self, capsule: PolicyCapsule) -> Result<ContentHash, PolicyError> {
        capsule.validate()?;
        let hash = capsule.hash()?;
        self.capsules.insert(hash, capsule);
        Ok(hash)
    }

    /// Lamport stamp for an outgoing envelope: `L ← L + 1`.
    pub fn next_send_lamport(&mut self) -> u64 {
        self.lamport += 1;
        self.lamport
    }

    fn effective_k_plan(&self) -> u32 {
        self.config.effective_k_plan(self.active_staked_verifiers())
    }

    fn effective_k_result(&self, slot_bump: u32) -> u32 {
        self.config
            .effective_k_result(self.active_staked_verifiers())
            .saturating_add(slot_bump)
    }

    fn active_staked_verifiers(&self) -> u32 {
        self.verifiers
            .iter()
            .filter(|v| self.ledger.stake(v) > 0)
            .count() as u32
    }

    /// Dedup key for the n-th fact carried by one envelope.
    fn derived_fact_id(envelope_id: &ContentHash, index: u32) -> ContentHash {
        let mut preimage = Vec::with_capacity(36);
        preimage.extend_from_slice(&envelope_id.0);
        preimage.extend_from_slice(&index.to_le_bytes());
        agora_crypto::content_hash(&preimage).unwrap_or(*envelope_id)
    }

    fn append_fact(&mut self, env: &Envelope, index: u32, fact: Fact) {
        let record = FactRecord {
            envelope_id: Self::derived_fact_id(&env.id, index),
            lamport: env.lamport,
            actor: env.sender.agent_id,
            fact,
        };
        self.plan.append(record);
    }

    // --- The ingestion pipeline ---

    /// Full pipeline for one envelope: authenticity, lamport discipline,
    /// ingress policy, exhaustive dispatch.
    pub fn ingest(&mut self, env: &Envelope, now_ms: u64) -> Result<Vec<Outbound>, IngestError> {
        // 1. Signature, id, sender identity, capability registration.
        verify_envelope(env).map_err(IngestError::Protocol)?;
        self.ingest_preverified(env, now_ms)
    }

    /// Pipeline minus the signature step, for envelopes already verified
    /// on the worker stage (or sealed by this node itself).
    pub fn ingest_preverified(
        &mut self,
        env: &Envelope,
        now_ms: u64,
    ) -> Result<Vec<Outbound>, IngestError> {
        // 2. Per-sender lamport monotonicity.
        let sender = env.sender.agent_id;
        if let Some(&last) = self.last_seen.get(&sender) {
            if env.lamport < last {
                return Err(IngestError::Protocol(ProtocolError::StaleLamport {
                    last,
                    got: env.lamport,
                }));
            }
        }
        self.last_seen.insert(sender, env.lamport);

        // 3. Receive rule: `L ← max(L, m.lamport) + 1`.
        self.lamport = self.lamport.max(env.lamport) + 1;

        // 4. Ingress gate. Every externally invocable verb passes policy
        // here; there is no bypass path to the handlers below.
        self.ingress_gate(env)?;

        let count = self.thread_msgs.entry(env.thread).or_insert(0);
        *count += 1;

        // 5. Closed-registry dispatch.
        self.dispatch(env, now_ms)
    }

    /// Sender-side gate, run after sealing and before publishing. A deny
    /// here means the message never leaves the node.
    pub fn preflight(&self, env: &Envelope) -> Result<(), PolicyError> {
        let capsule = self
            .capsules
            .get(&env.policy_capsule_hash)
            .ok_or(PolicyError::CapsuleUnavailable(env.policy_capsule_hash))?;
        let inputs = self.eval_inputs_for(env, Gate::Preflight, 0);
        self.gatekeeper
            .check(capsule, &env.policy_capsule_hash, &inputs, self.config.gas_limit)
            .map(|_| ())
    }

    fn ingress_gate(&mut self, env: &Envelope) -> Result<(), PolicyError> {
        let capsule = self
            .capsules
            .get(&env.policy_capsule_hash)
            .ok_or(PolicyError::CapsuleUnavailable(env.policy_capsule_hash))?;
        let inputs = self.eval_inputs_for(env, Gate::Ingress, 0);
        self.gatekeeper
            .check(capsule, &env.policy_capsule_hash, &inputs, self.config.gas_limit)
            .map(|_| ())
    }

    fn eval_inputs_for(&self, env: &Envelope, gate: Gate, elapsed_ms: u64) -> EvalInputs {
        let credits = match &env.verb {
            Verb::Need { budget, .. } => *budget,
            Verb::Commit { verify_bounty, .. } => *verify_bounty,
            Verb::Challenge { bond, .. } => *bond,
            _ => 0,
        };
        let tags = match &env.verb {
            Verb::Need { task_type, .. } => vec![task_type.clone()],
            _ => Vec::new(),
        };
        // Retry budgets bite at preflight: a NEED re-published past the
        // capsule's retry allowance is denied before it leaves the node.
        let retries = match &env.verb {
            Verb::Need { need, .. } => self
                .slots
                .get(need)
                .map_or(0, |slot| slot.retry_attempts),
            _ => 0,
        };
        EvalInputs {
            gate,
            verb: env.verb.kind(),
            capability: env.capability,
            sender: env.sender.agent_id,
            tags,
            credits,
            payload_bytes: 0,
            msgs_in_thread: self.thread_msgs.get(&env.thread).copied().unwrap_or(0),
            elapsed_ms,
            retries,
        }
    }

    /// Commit-gate evaluation for a committed task: same capsule, post-hoc
    /// telemetry. The digest goes into this verifier's ATTEST.
    ///
    /// All inputs derive from envelope data, never from this node's clock:
    /// verifiers evaluating the same commit must produce the same digest,
    /// and a disagreement has to mean a faulty evaluator, not clock skew.
    pub fn commit_gate(&self, task: &TaskId) -> Result<Decision, PolicyError> {
        let commit = self
            .commits
            .get(task)
            .ok_or(PolicyError::Denied {
                reasons: vec!["no_commit_for_task".into()],
            })?;
        let capsule = self
            .capsules
            .get(&commit.capsule_hash)
            .ok_or(PolicyError::CapsuleUnavailable(commit.capsule_hash))?;
        let opened = self
            .need_opened
            .get(&commit.need)
            .copied()
            .unwrap_or(commit.sender_timestamp);
        let elapsed = commit.sender_timestamp.saturating_sub(opened);
        let inputs = EvalInputs {
            gate: Gate::CommitGate,
            verb: agora_types::VerbKind::Commit,
            capability: agora_types::Capability::Execution,
            sender: commit.committer,
            tags: Vec::new(),
            credits: self
                .ledger
                .escrow(&EscrowId::Bounty(*task))
                .map_or(0, |row| row.amount),
            payload_bytes: commit.output_refs.len() as u64 * 32,
            msgs_in_thread: 0,
            elapsed_ms: elapsed,
            retries: 0,
        };
        self.gatekeeper
            .check(capsule, &commit.capsule_hash, &inputs, self.config.gas_limit)
    }

    fn require_verifier(&self, sender: &AgentId) -> Result<(), IngestError> {
        if !self.verifiers.contains(sender) {
            return Err(IngestError::Policy(PolicyError::Denied {
                reasons: vec!["verifier_capability_required".into()],
            }));
        }
        Ok(())
    }

    // --- Dispatch ---

    fn dispatch(&mut self, env: &Envelope, now: u64) -> Result<Vec<Outbound>, IngestError> {
        let sender = env.sender.agent_id;
        match env.verb.clone() {
            Verb::Need {
                need,
                epoch,
                budget,
                task_type,
            } => self.on_need(need, epoch, budget, task_type, sender, env.timestamp, now),
            Verb::Propose {
                need,
                epoch,
                proposal,
                price,
            } => {
                let slot = self
                    .slots
                    .get_mut(&need)
                    .ok_or(NegotiationError::UnknownNeed(need))?;
                slot.on_propose(proposal, sender, price, env.lamport, epoch, now)?;
                Ok(vec![])
            }
            Verb::AttestPlan {
                need,
                epoch,
                proposal,
            } => self.on_attest_plan(env, need, epoch, proposal, sender),
            Verb::Decide {
                need,
                epoch,
                proposal,
            } => self.on_decide(env, need, epoch, proposal),
            Verb::UpdatePlan { facts } => self.on_update_plan(env, facts),
            Verb::Reconcile { thread, summary } => {
                self.append_fact(env, 0, Fact::Reconcile { thread, summary });
                Ok(vec![])
            }
            Verb::Claim {
                need,
                epoch,
                task,
                fencing_token: _,
            } => {
                let ttl = self.config.lease_ttl_ms;
                let slot = self
                    .slots
                    .get_mut(&need)
                    .ok_or(NegotiationError::UnknownNeed(need))?;
                let lease = slot.on_claim(sender, task, epoch, now, ttl)?;
                self.task_needs.insert(task, need);
                debug!(target: "node", %need, %task, token = lease.fencing_token, "claim accepted");
                Ok(vec![])
            }
            Verb::Yield {
                need,
                epoch,
                fencing_token,
            }
            | Verb::Release {
                need,
                epoch,
                fencing_token,
            } => {
                let slot = self
                    .slots
                    .get_mut(&need)
                    .ok_or(NegotiationError::UnknownNeed(need))?;
                slot.on_release(sender, epoch, fencing_token)?;
                Ok(vec![])
            }
            Verb::Heartbeat {
                need,
                epoch,
                fencing_token,
            } => {
                let ttl = self.config.lease_ttl_ms;
                let slot = self
                    .slots
                    .get_mut(&need)
                    .ok_or(NegotiationError::UnknownNeed(need))?;
                slot.on_heartbeat(sender, epoch, fencing_token, now, ttl)?;
                Ok(vec![])
            }
            Verb::Commit {
                need,
                epoch,
                task,
                fencing_token,
                verify_bounty,
            } => self.on_commit(env, need, epoch, task, fencing_token, verify_bounty, now),
            Verb::Attest {
                task,
                verdict,
                policy_eval_digest,
            } => self.on_attest(env, task, verdict, policy_eval_digest),
            Verb::Finalize { need, task } => self.on_finalize(env, need, task, now),
            Verb::Challenge { task, class, bond } => {
                self.on_challenge(env, task, class, bond, now)
            }
            Verb::Invalidate { task, reason } => {
                self.require_verifier(&sender)?;
                self.append_fact(env, 0, Fact::Invalidate { task });
                info!(target: "node", %task, reason, "task invalidated");
                Ok(vec![])
            }
            Verb::Checkpoint { epoch, merkle_root } => {
                self.on_checkpoint(env, epoch, merkle_root, sender)
            }
            Verb::Reject { subject, reason } => {
                warn!(target: "node", %subject, reason, "peer rejected our envelope");
                Ok(vec![])
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_need(
        &mut self,
        need: NeedId,
        epoch: u64,
        budget: u64,
        task_type: String,
        sender: AgentId,
        opened_at: u64,
        now: u64,
    ) -> Result<Vec<Outbound>, IngestError> {
        self.requesters.entry(need).or_insert(sender);
        let accept = match self.slots.get(&need) {
            None => true,
            // A fresh epoch reopens a non-final slot (retry after an empty
            // window, or a heal racing ahead of us).
            Some(existing) => epoch > existing.epoch && existing.phase() != SlotPhase::Final,
        };
        if !accept {
            debug!(target: "node", %need, epoch, "duplicate NEED ignored");
            return Ok(vec![]);
        }
        let preserved_bump = self.slots.get(&need).map_or(0, |s| s.k_result_bump);
        let mut slot = NeedSlot::open(
            need,
            epoch,
            budget,
            task_type,
            now,
            self.config.bid_window_ms,
        );
        slot.k_result_bump = preserved_bump;
        self.slots.insert(need, slot);
        self.need_opened.insert(need, opened_at);
        Ok(vec![])
    }

    fn on_attest_plan(
        &mut self,
        _env: &Envelope,
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
        sender: AgentId,
    ) -> Result<Vec<Outbound>, IngestError> {
        self.require_verifier(&sender)?;
        let k_plan = self.effective_k_plan();
        let winner = self
            .plan_quorum
            .record_vote(need, epoch, proposal, sender, k_plan)?;
        let Some(winner) = winner else {
            return Ok(vec![]);
        };
        // Quorum reached locally. The verifier whose vote completed it is
        // the one that publishes the DECIDE; everyone else just waits for
        // that envelope.
        if sender == self.self_id {
            return Ok(vec![Outbound::Decide {
                need,
                epoch,
                proposal: winner,
            }]);
        }
        Ok(vec![])
    }

    fn on_decide(
        &mut self,
        env: &Envelope,
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
    ) -> Result<Vec<Outbound>, IngestError> {
        self.require_verifier(&env.sender.agent_id)?;
        let mut outbound = Vec::new();

        let slot = self.slots.entry(need).or_insert_with(|| {
            // A decide can precede the NEED on a healing partition; open a
            // shell slot so the lifecycle has somewhere to live.
            NeedSlot::open(need, epoch, 0, String::new(), 0, 0)
        });

        let superseded = slot
            .decided
            .filter(|prev| *prev != proposal && epoch > slot.epoch);
        slot.on_decide(proposal, epoch)?;
        self.plan_quorum.prune_below(need, epoch);
        self.task_needs.insert(proposal.root_task(), need);

        self.append_fact(env, 0, Fact::Decide {
            need,
            proposal,
            epoch,
        });
        self.append_fact(env, 1, Fact::State {
            task: proposal.root_task(),
            state: TaskState::Decided,
        });

        if let Some(loser) = superseded {
            // Partition heal: the higher epoch wins, the losing branch is
            // orphaned. A verifier records the merge for the thread.
            let salvaged: Vec<TaskId> = self.plan.view().salvageable().copied().collect();
            info!(
                target: "node",
                %need,
                winner = %proposal,
                orphaned = %loser,
                epoch,
                "higher-epoch decide superseded an earlier branch"
            );
            if self.verifier {
                outbound.push(Outbound::Reconcile {
                    thread: env.thread,
                    summary: ReconcileSummary {
                        winner: proposal,
                        winner_epoch: epoch,
                        orphaned: vec![loser],
                        salvaged,
                    },
                });
            }
        }
        Ok(outbound)
    }

    fn on_update_plan(
        &mut self,
        env: &Envelope,
        facts: Vec<Fact>,
    ) -> Result<Vec<Outbound>, IngestError> {
        // Cycle-creating links are refused at ingress, before any fact of
        // the batch lands.
        for fact in &facts {
            if let Fact::Link { parent, child } = fact {
                if self.plan.view().would_cycle(*parent, *child) {
                    return Err(IngestError::Protocol(ProtocolError::LinkCycle {
                        parent: *parent,
                        child: *child,
                    }));
                }
            }
        }
        for (i, fact) in facts.into_iter().enumerate() {
            self.append_fact(env, i as u32, fact);
        }
        Ok(vec![])
    }

    fn on_commit(
        &mut self,
        env: &Envelope,
        need: NeedId,
        epoch: u64,
        task: TaskId,
        fencing_token: u64,
        verify_bounty: u64,
        now: u64,
    ) -> Result<Vec<Outbound>, IngestError> {
        let sender = env.sender.agent_id;
        // Escrow the bounty first; a commit whose bounty cannot be locked
        // never enters the lifecycle.
        self.ledger
            .escrow_lock(EscrowId::Bounty(task), sender, verify_bounty)?;

        let slot = self
            .slots
            .get_mut(&need)
            .ok_or(NegotiationError::UnknownNeed(need))?;
        if let Err(e) = slot.on_commit(sender, epoch, fencing_token, now) {
            // Roll the escrow back; the commit was not accepted.
            let _ = self.ledger.escrow_refund(&EscrowId::Bounty(task));
            return Err(e.into());
        }

        self.commits.insert(
            task,
            CommitInfo {
                need,
                committer: sender,
                output_refs: env.content_refs.clone(),
                capsule_hash: env.policy_capsule_hash,
                sender_timestamp: env.timestamp,
            },
        );
        self.task_needs.insert(task, need);
        for (i, artifact) in env.content_refs.iter().enumerate() {
            self.append_fact(env, i as u32, Fact::Produces {
                task,
                artifact: *artifact,
            });
        }
        Ok(vec![])
    }

    fn on_attest(
        &mut self,
        env: &Envelope,
        task: TaskId,
        verdict: Verdict,
        policy_eval_digest: ContentHash,
    ) -> Result<Vec<Outbound>, IngestError> {
        let sender = env.sender.agent_id;
        self.require_verifier(&sender)?;
        if env.policy_eval_digest != Some(policy_eval_digest) {
            return Err(IngestError::Protocol(ProtocolError::Codec(
                "attest digest not mirrored in envelope".into(),
            )));
        }
        let need = *self
            .task_needs
            .get(&task)
            .ok_or(NegotiationError::UnknownTask(task))?;
        let bump = self.slots.get(&need).map_or(0, |s| s.k_result_bump);
        let k_result = self.effective_k_result(bump);

        match self
            .result_quorum
            .record(task, sender, verdict, policy_eval_digest, k_result)?
        {
            AttestOutcome::Pending { passes } => {
                debug!(target: "node", %task, passes, k_result, "attest pending");
                Ok(vec![])
            }
            AttestOutcome::QuorumReached { passes } => {
                let slot = self
                    .slots
                    .get_mut(&need)
                    .ok_or(NegotiationError::UnknownNeed(need))?;
                slot.on_verified()?;
                self.append_fact(env, 0, Fact::State {
                    task,
                    state: TaskState::Verified,
                });
                info!(target: "node", %task, passes, "result quorum reached");
                Ok(vec![])
            }
            AttestOutcome::Divergence(integrity) => {
                // Fatal audit event: quarantine the capsule. The task can
                // no longer advance (it never reaches Verified).
                error!(
                    target: "node",
                    %task,
                    code = integrity.code(),
                    "policy digest divergence, quarantining capsule"
                );
                if let Some(commit) = self.commits.get(&task) {
                    self.gatekeeper.quarantine(commit.capsule_hash);
                }
                Err(IngestError::Integrity(integrity))
            }
        }
    }

    fn on_finalize(
        &mut self,
        env: &Envelope,
        need: NeedId,
        task: TaskId,
        now: u64,
    ) -> Result<Vec<Outbound>, IngestError> {
        self.require_verifier(&env.sender.agent_id)?;
        let upheld = self.challenges.has_upheld(&task);
        let slot = self
            .slots
            .get_mut(&need)
            .ok_or(NegotiationError::UnknownNeed(need))?;
        if slot.phase() == SlotPhase::Final {
            return Ok(vec![]);
        }
        if !slot.finalize_ready(now, self.config.t_challenge_ms, upheld) {
            return Err(IngestError::Negotiation(NegotiationError::InvalidTransition {
                verb: "FINALIZE",
                phase: "not finalize-ready",
            }));
        }
        slot.on_finalize()?;

        self.append_fact(env, 0, Fact::Finalize { task });
        self.append_fact(env, 1, Fact::State {
            task,
            state: TaskState::Final,
        });
        self.finalized_jobs += 1;
        agora_telemetry::protocol_metrics().inc_tasks_finalized();

        // Committee payout: the bounty splits evenly across the verifiers
        // that attested pass. A concurrent finalize loses the one-shot
        // escrow race, which is fine — the payout happened exactly once.
        let attestors = self.result_quorum.pass_attestors(&task);
        if !attestors.is_empty() {
            let share = (10_000 / attestors.len() as u64) as u16;
            let shares: Vec<(AgentId, u16)> = attestors.iter().map(|a| (*a, share)).collect();
            match self.ledger.escrow_release_split(&EscrowId::Bounty(task), &shares) {
                Ok(amount) => {
                    info!(target: "node", %task, amount, verifiers = attestors.len(), "bounty released");
                    for a in &attestors {
                        self.ledger.adjust_reputation(*a, REPUTATION_REWARD);
                    }
                }
                Err(LedgerError::AlreadyReleased) => {
                    debug!(target: "node", %task, "bounty already released by an earlier finalize");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(vec![])
    }

    fn on_challenge(
        &mut self,
        env: &Envelope,
        task: TaskId,
        class: ChallengeClass,
        bond: u64,
        now: u64,
    ) -> Result<Vec<Outbound>, IngestError> {
        let challenger = env.sender.agent_id;
        let need = *self
            .task_needs
            .get(&task)
            .ok_or(NegotiationError::UnknownTask(task))?;
        let commit_ts = self
            .slots
            .get(&need)
            .and_then(|s| s.commit_ts)
            .ok_or(NegotiationError::InvalidTransition {
                verb: "CHALLENGE",
                phase: "no commit",
            })?;

        // Per-class ceiling on the economic exposure a challenge may carry.
        if let Some(cap) = self.config.bounty_caps_by_class.get(&class) {
            if bond > *cap {
                return Err(IngestError::Negotiation(NegotiationError::ChallengeRejected(
                    format!("bond {} exceeds class cap {}", bond, cap),
                )));
            }
        }

        // Bond first; a challenge that cannot post its bond is malformed.
        self.ledger
            .escrow_lock(EscrowId::ChallengeBond(task, challenger), challenger, bond)?;
        if let Err(e) = self.challenges.post(
            task,
            class,
            challenger,
            bond,
            now,
            commit_ts,
            self.config.t_challenge_ms,
            self.config.challenge_base_bond,
        ) {
            // A malformed challenge (late, under-bonded) forfeits its bond
            // just like a rejected one, so probing the window costs money.
            let _ = self
                .ledger
                .escrow_release_split(&EscrowId::ChallengeBond(task, challenger), &[]);
            return Err(e.into());
        }
        Ok(vec![])
    }

    fn on_checkpoint(
        &mut self,
        env: &Envelope,
        epoch: u64,
        merkle_root: ContentHash,
        sender: AgentId,
    ) -> Result<Vec<Outbound>, IngestError> {
        self.require_verifier(&sender)?;
        self.append_fact(env, 0, Fact::Checkpoint { epoch, merkle_root });

        let k_plan = self.effective_k_plan();
        let upto = self.plan.total_len();
        let stable = self
            .checkpoints
            .record(epoch, merkle_root, sender, upto, k_plan)
            .cloned();
        if let Some(stable) = stable {
            self.on_stable_checkpoint(&stable)?;
        }
        Ok(vec![])
    }

    fn on_stable_checkpoint(&mut self, stable: &StableCheckpoint) -> Result<(), IngestError> {
        // Cross-check the attested root against our own derived view
        // before pruning anything.
        let local = self
            .plan
            .checkpoint_root()
            .map_err(|e| IngestError::Protocol(ProtocolError::Crypto(e)))?;
        if local != stable.merkle_root {
            warn!(
                target: "node",
                epoch = stable.epoch,
                theirs = %stable.merkle_root,
                ours = %local,
                "stable checkpoint root differs from local view; deferring prune"
            );
            return Ok(());
        }
        let bound = stable.upto_records.min(self.plan.total_len());
        let pruned = self
            .plan
            .prune_before(bound)
            .map_err(|e| IngestError::Protocol(ProtocolError::Crypto(e)))?;
        info!(target: "node", epoch = stable.epoch, pruned, "pruned below stable checkpoint");
        Ok(())
    }

    /// Applies a verifier-panel ruling on an open challenge.
    pub fn resolve_challenge(
        &mut self,
        task: TaskId,
        challenger: AgentId,
        outcome: ChallengeOutcome,
    ) -> Result<Vec<Outbound>, IngestError> {
        let record = self.challenges.resolve(&task, &challenger, outcome)?;
        let bond_escrow = EscrowId::ChallengeBond(task, challenger);

        match outcome {
            ChallengeOutcome::Rejected => {
                // Forfeit: the bond burns.
                self.ledger.escrow_release_split(&bond_escrow, &[])?;
                Ok(vec![])
            }
            ChallengeOutcome::Upheld => {
                let need = *self
                    .task_needs
                    .get(&task)
                    .ok_or(NegotiationError::UnknownTask(task))?;

                // Slash every pass-attestor proportionally to the class
                // weight and pool the forfeits.
                let attestors = self.result_quorum.pass_attestors(&task);
                let slash_bps = (SLASH_BPS_PER_WEIGHT * record.class.weight()).min(10_000);
                let mut pot: u64 = 0;
                for attestor in &attestors {
                    let stake = self.ledger.stake(attestor);
                    let cut = stake.saturating_mul(slash_bps) / 10_000;
                    pot = pot.saturating_add(self.ledger.slash_stake(*attestor, cut)?);
                    self.ledger.adjust_reputation(*attestor, -REPUTATION_PENALTY);
                }

                // Reallocate per the capsule split; honest verifiers are
                // those that attested fail.
                let split = self
                    .commits
                    .get(&task)
                    .and_then(|c| self.capsules.get(&c.capsule_hash))
                    .map(|c| c.challenge_split)
                    .unwrap_or_default();
                let honest: Vec<AgentId> = self
                    .verifiers
                    .iter()
                    .filter(|v| !attestors.contains(v))
                    .copied()
                    .collect();
                self.ledger.distribute_forfeit(
                    pot,
                    challenger,
                    split.challenger_bps,
                    &honest,
                    split.honest_bps,
                )?;
                // Bond comes home.
                self.ledger.escrow_release(&bond_escrow, challenger)?;
                // The committed bounty returns to the requester for the
                // retry round.
                let _ = self.ledger.escrow_refund(&EscrowId::Bounty(task));

                // Reopen the slot under a bumped quorum.
                self.result_quorum.reset_task(&task);
                self.challenges.clear_upheld(&task);
                if let Some(slot) = self.slots.get_mut(&need) {
                    slot.reopen(K_RESULT_BUMP_ON_REOPEN);
                }
                self.commits.remove(&task);

                info!(target: "node", %task, pot, "challenge upheld; task reopened");
                Ok(vec![Outbound::Invalidate {
                    task,
                    reason: format!("challenge_upheld:{:?}", record.class),
                }])
            }
        }
    }

    // --- Timers ---

    /// Periodic pass: scavenge leases, close bid windows, finalize ready
    /// slots, emit checkpoints.
    pub fn tick(&mut self, now: u64) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        let needs: Vec<NeedId> = self.slots.keys().copied().collect();
        for need in needs {
            let backoff_base = self.config.backoff_base_ms;
            let bid_window = self.config.bid_window_ms;
            let t_challenge = self.config.t_challenge_ms;

            let Some(slot) = self.slots.get_mut(&need) else {
                continue;
            };

            if slot.scavenge(now) {
                agora_telemetry::protocol_metrics().inc_leases_scavenged();
            }

            match slot.close_bid_window(now, bid_window) {
                agora_protocol::slot::BidWindowOutcome::Retry { new_epoch, attempt } => {
                    if self.requesters.get(&need) == Some(&self.self_id) {
                        let delay = retry_delay_ms(backoff_base, attempt, &mut self.rng);
                        outbound.push(Outbound::NeedRetry {
                            need,
                            epoch: new_epoch,
                            budget: slot.budget,
                            task_type: slot.task_type.clone(),
                            delay_ms: delay,
                        });
                    }
                }
                agora_protocol::slot::BidWindowOutcome::NotDue
                | agora_protocol::slot::BidWindowOutcome::ReadyForQuorum => {}
            }

            if self.verifier {
                if let Some(task) = slot.decided_task() {
                    let upheld = self.challenges.has_upheld(&task);
                    if slot.finalize_ready(now, t_challenge, upheld) {
                        outbound.push(Outbound::Finalize { need, task });
                    }
                }
            }
        }

        self.observe_bootstrap_exit();

        if self.verifier {
            // Baseline the wall-clock cadence on the first tick so startup
            // does not look instantly overdue.
            if self.last_checkpoint_emitted_at == 0 {
                self.last_checkpoint_emitted_at = now;
            }
            let since = self.plan.total_len() - self.records_at_last_checkpoint;
            let overdue = now.saturating_sub(self.last_checkpoint_emitted_at)
                >= self.config.checkpoint_interval_ms;
            if since >= self.config.checkpoint_epoch_interval || (overdue && since > 0) {
                if let Ok(root) = self.plan.checkpoint_root() {
                    outbound.push(Outbound::Checkpoint {
                        epoch: self.next_checkpoint_epoch,
                        merkle_root: root,
                    });
                    self.next_checkpoint_epoch += 1;
                    self.records_at_last_checkpoint = self.plan.total_len();
                    self.last_checkpoint_emitted_at = now;
                }
            }
        }

        outbound
    }

    /// Bootstrap exit rule: enough staked verifiers for long enough, or
    /// enough jobs finalized. Once left, bootstrap never re-engages.
    fn observe_bootstrap_exit(&mut self) {
        if !self.config.bootstrap.enabled {
            return;
        }
        let b = &self.config.bootstrap;
        if self.active_staked_verifiers() >= b.verifier_threshold_m {
            self.bootstrap_observations += 1;
        } else {
            self.bootstrap_observations = 0;
        }
        if self.bootstrap_observations >= b.stability_d
            || self.finalized_jobs >= b.exit_after_finalized
        {
            self.config.bootstrap.enabled = false;
            info!(
                target: "node",
                observations = self.bootstrap_observations,
                finalized = self.finalized_jobs,
                "bootstrap mode exited; target quorums now in force"
            );
        }
    }

    /// Latest stable checkpoint, if any (persistence hook).
    pub fn latest_stable_checkpoint(&self) -> Option<&StableCheckpoint> {
        self.checkpoints.latest_stable()
    }

    /// Leases this node currently holds, for heartbeat emission.
    pub fn own_leases(&self) -> Vec<(NeedId, u64, u64)> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.phase() == SlotPhase::Leased)
            .filter_map(|(need, slot)| {
                slot.lease()
                    .filter(|l| l.holder == self.self_id)
                    .map(|l| (*need, slot.epoch, l.fencing_token))
            })
            .collect()
    }

    /// WAL recovery: re-append a persisted fact record. Only the
    /// replicated plan state is rebuilt this way; negotiation state
    /// reconverges from live traffic and lease expiry.
    pub fn restore_fact(&mut self, record: FactRecord) {
        self.plan.append(record);
    }

    /// Restores the persisted ledger replica after a restart.
    pub fn restore_ledger(&mut self, ledger: Ledger) {
        self.ledger = ledger;
    }
}
