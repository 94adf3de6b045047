//! The async shell around [`KernelState`].
//!
//! Holds the signing identity and the external collaborators (bus, CAS,
//! clock, persistence), seals outbound envelopes behind the preflight
//! gate, and runs the event loop: a bounded worker stage for signature
//! verification feeding a single-writer apply queue, plus the timer pass.
//! The kernel lock is never held across an await.

use crate::state::{KernelState, Outbound};
use agora_api::{ArtifactStore, BusTransport, TimeSource};
use agora_crypto::{verify_envelope, Signer};
use agora_ledger::Ledger;
use agora_policy::PolicyCapsule;
use agora_protocol::ChallengeOutcome;
use agora_router::{AdmissionPolicy, AdmissionProof, RouterConfig, Selector};
use agora_storage::{CheckpointStore, FactWal, LamportClockStore, LedgerStore};
use agora_storage::checkpoint_store::PersistedCheckpoint;
use agora_types::error::ErrorCode;
use agora_types::{
    AgentId, ChallengeClass, ContentHash, Envelope, Fact, NeedId, ProposalId, Sender, TaskId,
    ThreadId, UnsignedEnvelope, Verb, Verdict,
};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// How many envelopes may sit in signature verification at once.
const VERIFY_WORKERS: usize = 4;
/// Timer pass cadence, milliseconds.
const TICK_MS: u64 = 100;

/// What part a node plays in the mesh. Verifiers attest plans and
/// results; participants request, propose, and execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Participant,
    Verifier,
}

/// Optional crash-safe persistence bundle.
pub struct Persistence {
    pub wal: FactWal,
    pub clock_store: LamportClockStore,
    pub checkpoint_store: Mutex<CheckpointStore>,
    pub ledger_store: LedgerStore,
}

/// A NEED re-publication waiting out its backoff delay.
struct RetryJob {
    need: NeedId,
    epoch: u64,
    budget: u64,
    task_type: String,
    delay_ms: u64,
}

/// One mesh participant.
pub struct Node {
    signer: Signer,
    state: Mutex<KernelState>,
    bus: Arc<dyn BusTransport>,
    cas: Arc<dyn ArtifactStore>,
    clock: Arc<dyn TimeSource>,
    capsule_hash: ContentHash,
    engine_hash: ContentHash,
    thread: ThreadId,
    heartbeat_interval_ms: u64,
    persistence: Option<Persistence>,
    /// Next WAL sequence to persist.
    walled_upto: Mutex<u64>,
    /// Hands delayed NEED retries to the event loop's retry worker.
    retry_tx: Mutex<Option<mpsc::UnboundedSender<RetryJob>>>,
    /// Admitted candidate roster for committee selection.
    roster: Mutex<Vec<agora_types::manifest::CandidateProfile>>,
    selector: Selector,
    admission: AdmissionPolicy,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Signer,
        role: NodeRole,
        config: agora_types::config::KernelConfig,
        verifiers: BTreeSet<AgentId>,
        ledger: Ledger,
        capsule: PolicyCapsule,
        thread: ThreadId,
        bus: Arc<dyn BusTransport>,
        cas: Arc<dyn ArtifactStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let heartbeat_interval_ms = config.heartbeat_interval_ms;
        let engine_hash = capsule.engine_hash;
        let router_config = RouterConfig {
            diversity_caps: config.diversity_caps.clone(),
            ..RouterConfig::default()
        };
        let mut state = KernelState::new(
            config,
            signer.agent_id(),
            role == NodeRole::Verifier,
            verifiers,
            ledger,
        );
        let capsule_hash = state
            .install_capsule(capsule)
            .map_err(|e| anyhow!("capsule install failed: {}", e))?;
        Ok(Self {
            signer,
            state: Mutex::new(state),
            bus,
            cas,
            clock,
            capsule_hash,
            engine_hash,
            thread,
            heartbeat_interval_ms,
            persistence: None,
            walled_upto: Mutex::new(0),
            retry_tx: Mutex::new(None),
            roster: Mutex::new(Vec::new()),
            selector: Selector::new(router_config),
            admission: AdmissionPolicy::default(),
        })
    }

    /// Attaches crash-safe persistence, replaying the WAL into the plan
    /// log and restoring the lamport floor.
    pub fn with_persistence(mut self, persistence: Persistence, wal_path: &std::path::Path) -> Result<Self> {
        {
            let mut state = self.state.lock();
            if wal_path.exists() {
                let mut replayed = 0u64;
                for entry in agora_storage::WalIterator::open(wal_path)? {
                    match entry {
                        Ok((seq, record)) => {
                            state.restore_fact(record);
                            replayed = seq + 1;
                        }
                        Err(e) => {
                            // Torn tail: everything before it is intact.
                            warn!(target: "node", error = %e, "WAL replay stopped at torn tail");
                            break;
                        }
                    }
                }
                *self.walled_upto.lock() = replayed;
                info!(target: "node", replayed, "WAL replayed");
            }
            let floor = persistence.clock_store.recover()?;
            state.resume_lamport(floor);
            if let Some(ledger) = persistence.ledger_store.load()? {
                state.restore_ledger(ledger);
            }
        }
        self.persistence = Some(persistence);
        Ok(self)
    }

    /// Seeds test/deterministic retry jitter.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        self.state.lock().set_rng_seed(seed);
        self
    }

    pub fn agent_id(&self) -> AgentId {
        self.signer.agent_id()
    }

    /// Read access to the kernel for assertions and wiring.
    pub fn with_state<T>(&self, f: impl FnOnce(&KernelState) -> T) -> T {
        f(&self.state.lock())
    }

    /// Mutating access (genesis setup: minters, stake, capsules).
    pub fn with_state_mut<T>(&self, f: impl FnOnce(&mut KernelState) -> T) -> T {
        f(&mut self.state.lock())
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn seal(
        &self,
        verb: Verb,
        content_refs: Vec<ContentHash>,
        policy_eval_digest: Option<ContentHash>,
    ) -> Result<Envelope> {
        let lamport = self.state.lock().next_send_lamport();
        let unsigned = UnsignedEnvelope {
            thread: self.thread,
            sender: Sender {
                pubkey: self.signer.public_bytes(),
                agent_id: self.signer.agent_id(),
            },
            capability: verb.capability(),
            verb,
            content_refs,
            policy_capsule_hash: self.capsule_hash,
            policy_engine_hash: self.engine_hash,
            policy_eval_digest,
            lamport,
            timestamp: self.now(),
        };
        self.signer
            .seal(unsigned)
            .map_err(|e| anyhow!("seal failed: {}", e))
    }

    /// Seals, preflights, self-applies, and publishes one envelope.
    /// Returns the follow-up intents from the local application.
    async fn emit(
        &self,
        verb: Verb,
        content_refs: Vec<ContentHash>,
        policy_eval_digest: Option<ContentHash>,
    ) -> Result<Vec<Outbound>> {
        let env = self.seal(verb, content_refs, policy_eval_digest)?;

        // Preflight gate: a deny means the message never leaves.
        {
            let state = self.state.lock();
            state
                .preflight(&env)
                .map_err(|e| anyhow!("preflight denied ({}): {}", e.code(), e))?;
        }

        // Self-apply. The bus does not loop our messages back, so the
        // sender runs the same pipeline locally.
        let now = self.now();
        let outs = {
            let mut state = self.state.lock();
            match state.ingest_preverified(&env, now) {
                Ok(outs) => outs,
                Err(e) if e.is_surfaced() => {
                    warn!(target: "node", code = e.code(), "own envelope rejected locally");
                    Vec::new()
                }
                Err(e) => return Err(anyhow!("self-apply failed ({}): {}", e.code(), e)),
            }
        };
        self.persist_tail()?;

        self.bus.publish(env).await.context("bus publish")?;
        Ok(outs)
    }

    /// Publishes a verb and then drains every follow-up intent it and its
    /// descendants produce.
    pub async fn publish(
        &self,
        verb: Verb,
        content_refs: Vec<ContentHash>,
        policy_eval_digest: Option<ContentHash>,
    ) -> Result<()> {
        let outs = self.emit(verb, content_refs, policy_eval_digest).await?;
        self.drive(outs.into()).await
    }

    async fn drive(&self, mut queue: VecDeque<Outbound>) -> Result<()> {
        while let Some(out) = queue.pop_front() {
            match out {
                Outbound::Decide {
                    need,
                    epoch,
                    proposal,
                } => {
                    let outs = self
                        .emit(Verb::Decide {
                            need,
                            epoch,
                            proposal,
                        }, vec![], None)
                        .await?;
                    queue.extend(outs);
                }
                Outbound::Reconcile { thread: _, summary } => {
                    let outs = self
                        .emit(
                            Verb::Reconcile {
                                thread: self.thread,
                                summary,
                            },
                            vec![],
                            None,
                        )
                        .await?;
                    queue.extend(outs);
                }
                Outbound::Finalize { need, task } => {
                    let outs = self.emit(Verb::Finalize { need, task }, vec![], None).await?;
                    queue.extend(outs);
                }
                Outbound::Invalidate { task, reason } => {
                    let outs = self
                        .emit(Verb::Invalidate { task, reason }, vec![], None)
                        .await?;
                    queue.extend(outs);
                }
                Outbound::Checkpoint { epoch, merkle_root } => {
                    let outs = self
                        .emit(Verb::Checkpoint { epoch, merkle_root }, vec![], None)
                        .await?;
                    queue.extend(outs);
                }
                Outbound::Reject { subject, reason } => {
                    let outs = self.emit(Verb::Reject { subject, reason }, vec![], None).await?;
                    queue.extend(outs);
                }
                Outbound::NeedRetry {
                    need,
                    epoch,
                    budget,
                    task_type,
                    delay_ms,
                } => {
                    // Delayed retries go through the event loop's retry
                    // worker; without a running loop there is nothing to
                    // wait on, so the retry is simply not scheduled.
                    let job = RetryJob {
                        need,
                        epoch,
                        budget,
                        task_type,
                        delay_ms,
                    };
                    match &*self.retry_tx.lock() {
                        Some(tx) => {
                            let _ = tx.send(job);
                        }
                        None => {
                            warn!(target: "node", need = %job.need, "retry dropped: event loop not running");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a signature-verified inbound envelope.
    pub async fn handle_verified(&self, env: Envelope) -> Result<()> {
        let stopwatch = agora_telemetry::IngestStopwatch::begin(verb_name(&env.verb));
        let now = self.now();
        let result = {
            let mut state = self.state.lock();
            state.ingest_preverified(&env, now)
        };
        self.persist_tail()?;
        drop(stopwatch);
        match result {
            Ok(outs) => {
                agora_telemetry::ingest_metrics().inc_envelopes_accepted(verb_name(&env.verb));
                self.drive(outs.into()).await
            }
            Err(e) if e.is_surfaced() => {
                agora_telemetry::ingest_metrics().inc_policy_denials(e.code());
                debug!(target: "node", code = e.code(), envelope = %env.id, "envelope rejected");
                self.drive(
                    vec![Outbound::Reject {
                        subject: env.id,
                        reason: e.code().to_string(),
                    }]
                    .into(),
                )
                .await
            }
            Err(e) => {
                // Protocol and integrity faults: drop and audit.
                agora_telemetry::ingest_metrics().inc_envelopes_rejected(e.code());
                warn!(target: "node", code = e.code(), envelope = %env.id, "envelope dropped");
                Ok(())
            }
        }
    }

    /// Full inbound path including signature verification (used where the
    /// worker stage is not in play).
    pub async fn handle_incoming(&self, env: Envelope) -> Result<()> {
        if let Err(e) = verify_envelope(&env) {
            agora_telemetry::ingest_metrics().inc_envelopes_rejected(e.code());
            warn!(target: "node", code = e.code(), "envelope failed verification");
            return Ok(());
        }
        self.handle_verified(env).await
    }

    /// One timer pass.
    pub async fn tick(&self) -> Result<()> {
        let now = self.now();
        let outs = {
            let mut state = self.state.lock();
            state.tick(now)
        };
        self.persist_checkpoints()?;
        self.drive(outs.into()).await
    }

    /// Heartbeats for every lease this node holds.
    pub async fn heartbeat_held_leases(&self) -> Result<()> {
        let leases = self.state.lock().own_leases();
        for (need, epoch, fencing_token) in leases {
            self.publish(
                Verb::Heartbeat {
                    need,
                    epoch,
                    fencing_token,
                },
                vec![],
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// The event loop: bounded signature-verification stage feeding a
    /// single-writer apply loop, plus timers.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .bus
            .subscribe()
            .await
            .map_err(|e| anyhow!("subscribe: {}", e))?;
        let (verified_tx, mut verified_rx) = mpsc::channel::<Envelope>(1024);
        let workers = Arc::new(Semaphore::new(VERIFY_WORKERS));

        // Retry worker: waits out backoff delays, then re-publishes NEEDs.
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<RetryJob>();
        *self.retry_tx.lock() = Some(retry_tx);
        let retry_node = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(job) = retry_rx.recv().await {
                tokio::time::sleep(std::time::Duration::from_millis(job.delay_ms)).await;
                let verb = Verb::Need {
                    need: job.need,
                    epoch: job.epoch,
                    budget: job.budget,
                    task_type: job.task_type,
                };
                if let Err(e) = retry_node.publish(verb, vec![], None).await {
                    warn!(target: "node", error = %e, "need retry failed");
                }
            }
        });

        // Verification stage: CPU-bound, bounded, order-relaxed. Ordering
        // is restored by lamport discipline in the apply phase.
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let permit = match Arc::clone(&workers).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let tx = verified_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match verify_envelope(&env) {
                        Ok(()) => {
                            let _ = tx.send(env).await;
                        }
                        Err(e) => {
                            agora_telemetry::ingest_metrics().inc_envelopes_rejected(e.code());
                            warn!(target: "node", code = e.code(), "envelope failed verification");
                        }
                    }
                });
            }
        });

        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
        let mut heartbeats = tokio::time::interval(std::time::Duration::from_millis(
            self.heartbeat_interval_ms.max(1),
        ));
        loop {
            tokio::select! {
                maybe_env = verified_rx.recv() => {
                    match maybe_env {
                        Some(env) => {
                            if let Err(e) = self.handle_verified(env).await {
                                warn!(target: "node", error = %e, "apply failed");
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(target: "node", error = %e, "tick failed");
                    }
                }
                _ = heartbeats.tick() => {
                    if let Err(e) = self.heartbeat_held_leases().await {
                        warn!(target: "node", error = %e, "heartbeat pass failed");
                    }
                }
            }
        }
    }

    // --- Persistence hooks ---

    /// Writes any newly accepted facts to the WAL and records the clock.
    /// Persistence faults are fatal: ingestion must not outrun the log.
    fn persist_tail(&self) -> Result<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let mut upto = self.walled_upto.lock();
        let state = self.state.lock();
        for (seq, record) in state.plan().records_from(*upto) {
            p.wal.append(seq, record)?;
            *upto = seq + 1;
        }
        p.clock_store.record(state.lamport())?;
        p.ledger_store.save(&state.ledger)?;
        Ok(())
    }

    /// Shutdown path: force-sync the clock and ledger regardless of
    /// batching. Leases and windows need no teardown; they expire.
    pub fn flush(&self) -> Result<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let state = self.state.lock();
        p.clock_store.flush(state.lamport())?;
        p.ledger_store.save(&state.ledger)?;
        Ok(())
    }

    /// Persists a newly stable checkpoint and compacts the WAL behind it.
    fn persist_checkpoints(&self) -> Result<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let stable = {
            let state = self.state.lock();
            state.latest_stable_checkpoint().cloned()
        };
        let Some(stable) = stable else {
            return Ok(());
        };
        let mut store = p.checkpoint_store.lock();
        if store.latest().map_or(true, |c| c.epoch < stable.epoch) {
            store.record(PersistedCheckpoint {
                epoch: stable.epoch,
                merkle_root: stable.merkle_root,
                attestors: stable.attestors.iter().copied().collect(),
                upto_records: stable.upto_records,
            })?;
            p.wal.compact(stable.upto_records)?;
        }
        Ok(())
    }

    // --- Participant conveniences (the "mind" facing API) ---

    /// Opens a need slot with an escrowable budget.
    pub async fn publish_need(
        &self,
        need: NeedId,
        budget: u64,
        task_type: &str,
    ) -> Result<()> {
        self.publish(
            Verb::Need {
                need,
                epoch: 1,
                budget,
                task_type: task_type.to_string(),
            },
            vec![],
            None,
        )
        .await
    }

    /// Bids a plan subtree for a need.
    pub async fn propose(
        &self,
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
        price: u64,
    ) -> Result<()> {
        self.publish(
            Verb::Propose {
                need,
                epoch,
                proposal,
                price,
            },
            vec![],
            None,
        )
        .await
    }

    /// Votes for a proposal (verifier).
    pub async fn attest_plan(
        &self,
        need: NeedId,
        epoch: u64,
        proposal: ProposalId,
    ) -> Result<()> {
        self.publish(
            Verb::AttestPlan {
                need,
                epoch,
                proposal,
            },
            vec![],
            None,
        )
        .await
    }

    /// Claims the decided task of a need.
    pub async fn claim(&self, need: NeedId, epoch: u64, task: TaskId) -> Result<()> {
        self.publish(
            Verb::Claim {
                need,
                epoch,
                task,
                fencing_token: 0,
            },
            vec![],
            None,
        )
        .await
    }

    /// Publishes outputs to the CAS and commits the task with an escrowed
    /// verify bounty. The artifacts are reachable before the references
    /// are announced.
    pub async fn commit(
        &self,
        need: NeedId,
        epoch: u64,
        task: TaskId,
        fencing_token: u64,
        verify_bounty: u64,
        outputs: &[&[u8]],
    ) -> Result<Vec<ContentHash>> {
        let mut refs = Vec::with_capacity(outputs.len());
        for bytes in outputs {
            let h = self
                .cas
                .put(bytes)
                .await
                .map_err(|e| anyhow!("artifact put: {}", e))?;
            refs.push(h);
        }
        self.publish(
            Verb::Commit {
                need,
                epoch,
                task,
                fencing_token,
                verify_bounty,
            },
            refs.clone(),
            None,
        )
        .await?;
        Ok(refs)
    }

    /// Runs the commit gate and attests the result (verifier).
    pub async fn attest(&self, task: TaskId, verdict: Verdict) -> Result<()> {
        let decision = {
            let state = self.state.lock();
            state
                .commit_gate(&task)
                .map_err(|e| anyhow!("commit gate: {}", e))?
        };
        self.publish(
            Verb::Attest {
                task,
                verdict,
                policy_eval_digest: decision.digest,
            },
            vec![],
            Some(decision.digest),
        )
        .await
    }

    /// Posts a bonded, typed challenge.
    pub async fn challenge(
        &self,
        task: TaskId,
        class: ChallengeClass,
        bond: u64,
    ) -> Result<()> {
        self.publish(Verb::Challenge { task, class, bond }, vec![], None)
            .await
    }

    /// Appends plan facts outside the bidding flow.
    pub async fn update_plan(&self, facts: Vec<Fact>) -> Result<()> {
        self.publish(Verb::UpdatePlan { facts }, vec![], None).await
    }

    /// Admits a candidate into the routing roster. The identity must show
    /// stake or identity-bound work before routing will consider it.
    pub fn register_candidate(
        &self,
        profile: agora_types::manifest::CandidateProfile,
        proof: &AdmissionProof,
    ) -> Result<()> {
        self.admission
            .admit(&profile.agent_id, proof)
            .map_err(|e| anyhow!("admission: {}", e))?;
        let mut roster = self.roster.lock();
        roster.retain(|c| c.agent_id != profile.agent_id);
        roster.push(profile);
        Ok(())
    }

    /// Selects a diversity-capped committee for a task type and budget:
    /// filter → shortlist → committee. The top-2 canary pair rides along
    /// for pre-dispatch calibration.
    pub fn select_committee(
        &self,
        task_type: &str,
        budget: u64,
        size: usize,
        now_epoch: u64,
        max_idle_epochs: u64,
    ) -> Result<(Vec<AgentId>, Option<agora_router::CanaryPair>)> {
        let roster = self.roster.lock();
        let filtered = self
            .selector
            .filter(&roster, task_type, budget, now_epoch, max_idle_epochs);
        let ranked = self.selector.shortlist(filtered, now_epoch);
        let canary = self.selector.canary_pair(&ranked);
        let committee = self
            .selector
            .select_committee(&ranked, size)
            .map_err(|e| anyhow!("committee selection: {}", e))?;
        Ok((committee, canary))
    }

    /// Applies a verifier-panel ruling and drives its effects.
    pub async fn resolve_challenge(
        &self,
        task: TaskId,
        challenger: AgentId,
        outcome: ChallengeOutcome,
    ) -> Result<()> {
        let outs = {
            let mut state = self.state.lock();
            state
                .resolve_challenge(task, challenger, outcome)
                .map_err(|e| anyhow!("challenge resolution: {}", e))?
        };
        self.drive(outs.into()).await
    }
}

fn verb_name(verb: &Verb) -> &'static str {
    match verb.kind() {
        agora_types::VerbKind::Need => "NEED",
        agora_types::VerbKind::Propose => "PROPOSE",
        agora_types::VerbKind::AttestPlan => "ATTEST_PLAN",
        agora_types::VerbKind::Decide => "DECIDE",
        agora_types::VerbKind::UpdatePlan => "UPDATE_PLAN",
        agora_types::VerbKind::Reconcile => "RECONCILE",
        agora_types::VerbKind::Claim => "CLAIM",
        agora_types::VerbKind::Yield => "YIELD",
        agora_types::VerbKind::Release => "RELEASE",
        agora_types::VerbKind::Heartbeat => "HEARTBEAT",
        agora_types::VerbKind::Commit => "COMMIT",
        agora_types::VerbKind::Attest => "ATTEST",
        agora_types::VerbKind::Finalize => "FINALIZE",
        agora_types::VerbKind::Challenge => "CHALLENGE",
        agora_types::VerbKind::Invalidate => "INVALIDATE",
        agora_types::VerbKind::Checkpoint => "CHECKPOINT",
        agora_types::VerbKind::Reject => "REJECT",
    }
}
