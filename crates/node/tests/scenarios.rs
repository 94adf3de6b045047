//! End-to-end lifecycle scenarios over a deterministic in-process mesh.
//!
//! Five participants share a simulated bus: a requester (0), a worker (1),
//! and three staked verifiers (2..5). Envelopes are sealed with real keys
//! and applied to every node's kernel; follow-up intents are re-broadcast
//! until quiescent. Time is an explicit argument everywhere, so windows
//! and leases are exercised at their exact boundaries.

use agora_ledger::{EscrowId, Ledger, MintOrder};
use agora_node::{KernelState, Outbound};
use agora_protocol::{ChallengeOutcome, SlotPhase};
use agora_test_utils::fixtures::{self, EnvelopeFactory};
use agora_types::config::KernelConfig;
use agora_types::{
    AgentId, ChallengeClass, ContentHash, Fact, NeedId, ProposalId, TaskId, TaskState, Verb,
    Verdict,
};
use std::collections::{BTreeSet, VecDeque};

const REQUESTER: usize = 0;
const WORKER: usize = 1;
const V1: usize = 2;
const V2: usize = 3;
const V3: usize = 4;

struct Sim {
    factories: Vec<EnvelopeFactory>,
    nodes: Vec<KernelState>,
}

fn test_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.k_plan = 2;
    config.k_result = 3;
    config.t_challenge_ms = 60_000;
    config.lease_ttl_ms = 30_000;
    config.bid_window_ms = 10_000;
    config.challenge_base_bond = 10;
    config.bootstrap.enabled = false;
    config
}

fn genesis_ledger(ids: &[AgentId], verifiers: &BTreeSet<AgentId>) -> Ledger {
    let minter = fixtures::keypair(99);
    let minter_id = agora_crypto::agent_id_from_pubkey(&minter.public_bytes()).unwrap();
    let mut ledger = Ledger::new();
    ledger.register_minter(minter_id).unwrap();
    for (i, id) in ids.iter().enumerate() {
        let order = MintOrder {
            to: *id,
            amount: 1_000,
            nonce: i as u64 + 1,
        };
        let sig = minter.sign(&order.signing_bytes().unwrap()).unwrap();
        ledger.mint(&order, &minter.public_bytes(), &sig).unwrap();
    }
    for v in verifiers {
        ledger.bond_stake(*v, 200).unwrap();
    }
    ledger
}

impl Sim {
    fn new(config: KernelConfig) -> Self {
        let factories: Vec<EnvelopeFactory> = (1u8..=5)
            .map(|seed| EnvelopeFactory::new(fixtures::signer(seed)))
            .collect();
        let ids: Vec<AgentId> = factories.iter().map(EnvelopeFactory::agent_id).collect();
        let verifiers: BTreeSet<AgentId> = ids.iter().skip(2).copied().collect();
        let ledger = genesis_ledger(&ids, &verifiers);

        let capsule = fixtures::permissive_capsule();
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut state = KernelState::new(
                    config.clone(),
                    *id,
                    i >= 2,
                    verifiers.clone(),
                    ledger.clone(),
                )
                .with_rng_seed(7);
                state.install_capsule(capsule.clone()).unwrap();
                state
            })
            .collect();
        Sim { factories, nodes }
    }

    /// Seals `verb` as `origin` and applies it to the given nodes,
    /// re-broadcasting every follow-up intent until quiescent.
    fn publish_to(
        &mut self,
        origin: usize,
        verb: Verb,
        refs: Vec<ContentHash>,
        digest: Option<ContentHash>,
        now: u64,
        targets: &[usize],
    ) {
        let mut queue: VecDeque<(usize, Verb, Vec<ContentHash>, Option<ContentHash>)> =
            VecDeque::new();
        queue.push_back((origin, verb, refs, digest));

        while let Some((from, verb, refs, digest)) = queue.pop_front() {
            let env = match digest {
                Some(d) => self.factories[from].seal_with_digest(verb, d, now),
                None => self.factories[from].seal(verb, refs, now),
            };
            for &i in targets {
                match self.nodes[i].ingest(&env, now) {
                    Ok(outs) => {
                        for out in outs {
                            if let Some(next) = outbound_to_send(out) {
                                queue.push_back((i, next.0, next.1, next.2));
                            }
                        }
                    }
                    Err(_) => {
                        // Dropped or surfaced; scenarios assert on state,
                        // not on per-node rejection bookkeeping.
                    }
                }
            }
        }
    }

    fn publish(
        &mut self,
        origin: usize,
        verb: Verb,
        refs: Vec<ContentHash>,
        digest: Option<ContentHash>,
        now: u64,
    ) {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.publish_to(origin, verb, refs, digest, now, &all);
    }

    /// Runs the timer pass on one node and broadcasts what it emits.
    fn tick(&mut self, idx: usize, now: u64) {
        let outs = self.nodes[idx].tick(now);
        for out in outs {
            if let Some((verb, refs, digest)) = outbound_to_send(out) {
                self.publish(idx, verb, refs, digest, now);
            }
        }
    }

    fn agent(&self, idx: usize) -> AgentId {
        self.factories[idx].agent_id()
    }

    fn commit_digest(&self, idx: usize, task: &TaskId) -> ContentHash {
        self.nodes[idx].commit_gate(task).unwrap().digest
    }

    fn assert_conservation(&self) {
        for node in &self.nodes {
            node.ledger.check_conservation().unwrap();
        }
    }
}

fn outbound_to_send(out: Outbound) -> Option<(Verb, Vec<ContentHash>, Option<ContentHash>)> {
    match out {
        Outbound::Decide {
            need,
            epoch,
            proposal,
        } => Some((
            Verb::Decide {
                need,
                epoch,
                proposal,
            },
            vec![],
            None,
        )),
        Outbound::Reconcile { thread, summary } => {
            Some((Verb::Reconcile { thread, summary }, vec![], None))
        }
        Outbound::Finalize { need, task } => Some((Verb::Finalize { need, task }, vec![], None)),
        Outbound::Invalidate { task, reason } => {
            Some((Verb::Invalidate { task, reason }, vec![], None))
        }
        Outbound::Checkpoint { epoch, merkle_root } => {
            Some((Verb::Checkpoint { epoch, merkle_root }, vec![], None))
        }
        Outbound::Reject { subject, reason } => {
            Some((Verb::Reject { subject, reason }, vec![], None))
        }
        // Retries are wall-clock scheduled by the async shell; the sim
        // re-issues NEEDs explicitly where a scenario wants them.
        Outbound::NeedRetry { .. } => None,
    }
}

fn need_id() -> NeedId {
    NeedId([0x11; 32])
}

fn proposal_a() -> ProposalId {
    ProposalId([0xA1; 32])
}

fn proposal_b() -> ProposalId {
    ProposalId([0xB1; 32])
}

/// Drives NEED → PROPOSE → plan quorum → CLAIM → COMMIT, returning the
/// fencing token and commit time.
fn run_to_commit(sim: &mut Sim, now_start: u64, bounty: u64) -> (TaskId, u64, u64) {
    let need = need_id();
    let proposal = proposal_a();
    let task = proposal.root_task();

    sim.publish(
        REQUESTER,
        Verb::Need {
            need,
            epoch: 1,
            budget: 100,
            task_type: "summarize".into(),
        },
        vec![],
        None,
        now_start,
    );
    sim.publish(
        WORKER,
        Verb::Propose {
            need,
            epoch: 1,
            proposal,
            price: 40,
        },
        vec![],
        None,
        now_start + 1_000,
    );
    for v in [V1, V2] {
        sim.publish(
            v,
            Verb::AttestPlan {
                need,
                epoch: 1,
                proposal,
            },
            vec![],
            None,
            now_start + 2_000,
        );
    }
    for node in &sim.nodes {
        assert_eq!(node.slot(&need).unwrap().phase(), SlotPhase::Decided);
    }

    sim.publish(
        WORKER,
        Verb::Claim {
            need,
            epoch: 1,
            task,
            fencing_token: 0,
        },
        vec![],
        None,
        now_start + 3_000,
    );
    let token = sim.nodes[WORKER]
        .slot(&need)
        .unwrap()
        .lease()
        .unwrap()
        .fencing_token;

    let commit_ts = now_start + 5_000;
    sim.publish(
        WORKER,
        Verb::Commit {
            need,
            epoch: 1,
            task,
            fencing_token: token,
            verify_bounty: bounty,
        },
        vec![ContentHash([0xCC; 32])],
        None,
        commit_ts,
    );
    (task, token, commit_ts)
}

fn attest_all(sim: &mut Sim, task: TaskId, now: u64) {
    for v in [V1, V2, V3] {
        let digest = sim.commit_digest(v, &task);
        sim.publish(
            v,
            Verb::Attest {
                task,
                verdict: Verdict::Pass,
                policy_eval_digest: digest,
            },
            vec![],
            Some(digest),
            now,
        );
    }
}

#[test]
fn happy_path_finalizes_and_pays_the_committee() {
    let mut sim = Sim::new(test_config());
    let need = need_id();
    let (task, _token, commit_ts) = run_to_commit(&mut sim, 0, 20);

    attest_all(&mut sim, task, commit_ts + 1_000);
    for node in &sim.nodes {
        assert_eq!(node.slot(&need).unwrap().phase(), SlotPhase::Verified);
    }

    // One tick inside the window must not finalize.
    sim.tick(V1, commit_ts + 59_999);
    assert_eq!(
        sim.nodes[REQUESTER].slot(&need).unwrap().phase(),
        SlotPhase::Verified
    );

    // At the boundary the window has elapsed.
    sim.tick(V1, commit_ts + 60_000);
    for node in &sim.nodes {
        assert_eq!(node.slot(&need).unwrap().phase(), SlotPhase::Final);
        let task_node = node.plan().view().task(&task).unwrap();
        assert_eq!(task_node.state, TaskState::Final);
    }

    // 20 credits split three ways: 6 each, dust burned.
    for v in [V1, V2, V3] {
        let id = sim.agent(v);
        assert_eq!(sim.nodes[REQUESTER].ledger.balance(&id), 1_000 - 200 + 6);
    }
    let worker_id = sim.agent(WORKER);
    assert_eq!(
        sim.nodes[REQUESTER].ledger.balance(&worker_id),
        1_000 - 20
    );
    sim.assert_conservation();
}

#[test]
fn missed_heartbeats_scavenge_the_lease_for_a_second_claim() {
    let mut sim = Sim::new(test_config());
    let need = need_id();
    let proposal = proposal_a();
    let task = proposal.root_task();

    sim.publish(
        REQUESTER,
        Verb::Need {
            need,
            epoch: 1,
            budget: 100,
            task_type: "summarize".into(),
        },
        vec![],
        None,
        0,
    );
    sim.publish(
        WORKER,
        Verb::Propose {
            need,
            epoch: 1,
            proposal,
            price: 40,
        },
        vec![],
        None,
        1_000,
    );
    for v in [V1, V2] {
        sim.publish(
            v,
            Verb::AttestPlan {
                need,
                epoch: 1,
                proposal,
            },
            vec![],
            None,
            2_000,
        );
    }

    // First claim, then silence: no heartbeat for a full TTL.
    sim.publish(
        V3,
        Verb::Claim {
            need,
            epoch: 1,
            task,
            fencing_token: 0,
        },
        vec![],
        None,
        3_000,
    );
    for i in 0..sim.nodes.len() {
        sim.tick(i, 3_000 + 30_000);
        assert_eq!(sim.nodes[i].slot(&need).unwrap().phase(), SlotPhase::Decided);
    }

    // A second claimant takes a fresh fenced lease and completes.
    sim.publish(
        WORKER,
        Verb::Claim {
            need,
            epoch: 1,
            task,
            fencing_token: 0,
        },
        vec![],
        None,
        34_000,
    );
    let token = sim.nodes[WORKER]
        .slot(&need)
        .unwrap()
        .lease()
        .unwrap()
        .fencing_token;
    assert_eq!(token, 2);

    let commit_ts = 35_000;
    sim.publish(
        WORKER,
        Verb::Commit {
            need,
            epoch: 1,
            task,
            fencing_token: token,
            verify_bounty: 20,
        },
        vec![ContentHash([0xCC; 32])],
        None,
        commit_ts,
    );
    attest_all(&mut sim, task, commit_ts + 1_000);
    sim.tick(V2, commit_ts + 60_000);
    assert_eq!(
        sim.nodes[REQUESTER].slot(&need).unwrap().phase(),
        SlotPhase::Final
    );
    sim.assert_conservation();
}

#[test]
fn upheld_challenge_slashes_attestors_and_reopens_with_a_larger_quorum() {
    let mut sim = Sim::new(test_config());
    let need = need_id();
    let (task, _token, commit_ts) = run_to_commit(&mut sim, 0, 20);
    attest_all(&mut sim, task, commit_ts + 1_000);

    // Challenge posted 30s into the 60s window.
    let challenger = sim.agent(REQUESTER);
    sim.publish(
        REQUESTER,
        Verb::Challenge {
            task,
            class: ChallengeClass::SchemaViolation,
            bond: 10,
        },
        vec![],
        None,
        commit_ts + 30_000,
    );
    for node in &sim.nodes {
        assert_eq!(
            node.ledger.escrow(&EscrowId::ChallengeBond(task, challenger)).unwrap().amount,
            10
        );
    }

    // The panel concurs; every node applies the ruling.
    let mut invalidates = Vec::new();
    for node in &mut sim.nodes {
        let outs = node
            .resolve_challenge(task, challenger, ChallengeOutcome::Upheld)
            .unwrap();
        invalidates.push(outs);
    }
    // One verifier publishes the INVALIDATE everyone derived.
    for out in invalidates.swap_remove(V1) {
        if let Some((verb, refs, digest)) = match out {
            Outbound::Invalidate { task, reason } => {
                Some((Verb::Invalidate { task, reason }, vec![], None))
            }
            _ => None,
        } {
            sim.publish(V1, verb, refs, digest, commit_ts + 31_000);
        }
    }

    for node in &sim.nodes {
        // SchemaViolation weight 1 => 10% of 200 stake slashed.
        for v in [V1, V2, V3] {
            let id = sim.factories[v].agent_id();
            assert_eq!(node.ledger.stake(&id), 180);
        }
        // Bond out and back nets zero; the challenger share of the
        // 60-credit slash pot is 50% = 30.
        assert_eq!(node.ledger.balance(&challenger), 1_030);
        // Slot reopened for a retry with a bumped quorum.
        let slot = node.slot(&need).unwrap();
        assert_eq!(slot.phase(), SlotPhase::Decided);
        assert_eq!(slot.k_result_bump, 2);
        // Task is invalidated in the derived view.
        assert!(node.plan().view().task(&task).unwrap().invalidated);
    }
    sim.assert_conservation();
}

#[test]
fn partition_heal_prefers_the_higher_epoch_and_records_a_reconcile() {
    let mut config = test_config();
    config.k_plan = 1;
    let mut sim = Sim::new(config);
    let need = need_id();
    let side_a: Vec<usize> = vec![REQUESTER, V1];
    let side_b: Vec<usize> = vec![WORKER, V2, V3];

    // The NEED reaches everyone before the split.
    sim.publish(
        REQUESTER,
        Verb::Need {
            need,
            epoch: 1,
            budget: 100,
            task_type: "summarize".into(),
        },
        vec![],
        None,
        0,
    );

    // Side A: proposal A with a small subtree, decided at epoch 1.
    let child_a = TaskId([0xA2; 32]);
    sim.publish_to(
        REQUESTER,
        Verb::UpdatePlan {
            facts: vec![
                Fact::AddTask {
                    task: proposal_a().root_task(),
                    task_type: "draft".into(),
                    requires: vec![],
                    produces: vec![],
                },
                Fact::Link {
                    parent: proposal_a().root_task(),
                    child: child_a,
                },
                Fact::Produces {
                    task: child_a,
                    artifact: ContentHash([0xAD; 32]),
                },
            ],
        },
        vec![],
        None,
        1_000,
        &side_a,
    );
    sim.publish_to(
        REQUESTER,
        Verb::Propose {
            need,
            epoch: 1,
            proposal: proposal_a(),
            price: 40,
        },
        vec![],
        None,
        1_500,
        &side_a,
    );
    sim.publish_to(
        V1,
        Verb::AttestPlan {
            need,
            epoch: 1,
            proposal: proposal_a(),
        },
        vec![],
        None,
        2_000,
        &side_a,
    );
    assert_eq!(
        sim.nodes[REQUESTER]
            .plan()
            .view()
            .effective_decide(&need)
            .unwrap()
            .proposal,
        proposal_a()
    );

    // Side B: proposal B decided at epoch 2.
    sim.publish_to(
        WORKER,
        Verb::Propose {
            need,
            epoch: 2,
            proposal: proposal_b(),
            price: 30,
        },
        vec![],
        None,
        1_500,
        &side_b,
    );
    sim.publish_to(
        V2,
        Verb::AttestPlan {
            need,
            epoch: 2,
            proposal: proposal_b(),
        },
        vec![],
        None,
        2_000,
        &side_b,
    );

    // Heal: replay each side's DECIDE to the other side. The decide
    // envelopes were produced by the completing voters above; replaying
    // the underlying facts is equivalent and simpler here.
    sim.publish_to(
        V2,
        Verb::Decide {
            need,
            epoch: 2,
            proposal: proposal_b(),
        },
        vec![],
        None,
        3_000,
        &side_a,
    );
    sim.publish_to(
        V1,
        Verb::Decide {
            need,
            epoch: 1,
            proposal: proposal_a(),
        },
        vec![],
        None,
        3_000,
        &side_b,
    );

    for (i, node) in sim.nodes.iter().enumerate() {
        let effective = node.plan().view().effective_decide(&need).unwrap();
        assert_eq!(effective.proposal, proposal_b(), "node {}", i);
        assert_eq!(effective.epoch, 2, "node {}", i);
    }
    // Side A's branch is orphaned where it is known, and its artifact-
    // bearing child is salvageable.
    let view = sim.nodes[REQUESTER].plan().view();
    assert!(view.is_orphaned(&proposal_a().root_task()));
    assert!(view.is_orphaned(&child_a));
    assert!(view.salvageable().any(|t| *t == child_a));
    // The healing verifier recorded a reconcile for the thread.
    assert!(sim.nodes[REQUESTER].plan().view().reconciles().next().is_some());
}

#[test]
fn concurrent_finalizes_release_the_bounty_exactly_once() {
    let mut sim = Sim::new(test_config());
    let need = need_id();
    let (task, _token, commit_ts) = run_to_commit(&mut sim, 0, 21);
    attest_all(&mut sim, task, commit_ts + 1_000);

    // Two verifiers decide to finalize in the same instant; both
    // envelopes land on every node.
    let now = commit_ts + 60_000;
    sim.publish(V1, Verb::Finalize { need, task }, vec![], None, now);
    sim.publish(V2, Verb::Finalize { need, task }, vec![], None, now);

    // 21 at 3333 bps each pays 6 per verifier, exactly once; the 3
    // credits of rounding dust burn.
    for v in [V1, V2, V3] {
        let id = sim.agent(v);
        assert_eq!(sim.nodes[REQUESTER].ledger.balance(&id), 1_000 - 200 + 6);
    }
    assert_eq!(sim.nodes[REQUESTER].ledger.burned_total(), 3);
    assert!(matches!(
        sim.nodes[REQUESTER]
            .ledger
            .escrow(&EscrowId::Bounty(task))
            .unwrap()
            .state,
        agora_ledger::EscrowState::Released
    ));
    sim.assert_conservation();
}

#[test]
fn checkpoint_quorum_prunes_hot_storage_with_proofs() {
    let mut config = test_config();
    config.checkpoint_epoch_interval = 16;
    let mut sim = Sim::new(config);

    // Fill the log past the checkpoint interval.
    for batch in 0..4u8 {
        let facts: Vec<Fact> = (0..4u8)
            .map(|i| Fact::Annotate {
                task: TaskId([batch; 32]),
                key: format!("k{}", i),
                val: "v".into(),
            })
            .collect();
        sim.publish(
            REQUESTER,
            Verb::UpdatePlan { facts },
            vec![],
            None,
            u64::from(batch) * 100,
        );
    }
    let total = sim.nodes[REQUESTER].plan().total_len();
    assert_eq!(total, 16);
    let victim = sim.nodes[REQUESTER].plan().hot_records()[3].clone();

    // Two verifier ticks emit matching roots; the second makes the
    // checkpoint stable and every node prunes below it.
    sim.tick(V1, 1_000);
    sim.tick(V2, 1_100);

    for node in &sim.nodes {
        assert!(node.plan().total_len() >= 16);
        assert!(
            node.plan().hot_records().len() < 16,
            "hot log should have been pruned"
        );
        let proof = node.plan().pruned_proof(&victim.envelope_id).unwrap();
        assert!(agora_plan::verify_proof(
            &proof.batch_root,
            &parity_scale_codec::Encode::encode(&victim),
            &proof.proof
        )
        .unwrap());
    }
}

#[test]
fn digest_divergence_quarantines_the_capsule_and_freezes_the_task() {
    let mut sim = Sim::new(test_config());
    let need = need_id();
    let (task, _token, commit_ts) = run_to_commit(&mut sim, 0, 20);

    let honest = sim.commit_digest(V1, &task);
    let mut divergent = honest;
    divergent.0[0] ^= 0xFF;

    sim.publish(
        V1,
        Verb::Attest {
            task,
            verdict: Verdict::Pass,
            policy_eval_digest: honest,
        },
        vec![],
        Some(honest),
        commit_ts + 1_000,
    );
    sim.publish(
        V2,
        Verb::Attest {
            task,
            verdict: Verdict::Pass,
            policy_eval_digest: divergent,
        },
        vec![],
        Some(divergent),
        commit_ts + 1_100,
    );

    let capsule_hash = sim.factories[V1].capsule_hash();
    for node in &sim.nodes {
        // Fatal audit: the capsule is quarantined everywhere.
        assert!(node.gatekeeper().is_quarantined(&capsule_hash));
        // The task never reached the result quorum.
        assert_eq!(node.slot(&need).unwrap().phase(), SlotPhase::Committed);
    }

    // Nothing governed by the capsule moves anymore: the third
    // attestation is refused at ingress.
    let digest = honest;
    sim.publish(
        V3,
        Verb::Attest {
            task,
            verdict: Verdict::Pass,
            policy_eval_digest: digest,
        },
        vec![],
        Some(digest),
        commit_ts + 2_000,
    );
    assert_eq!(
        sim.nodes[REQUESTER].slot(&need).unwrap().phase(),
        SlotPhase::Committed
    );
    // And the window can elapse without a finalize.
    sim.tick(V1, commit_ts + 120_000);
    assert_eq!(
        sim.nodes[REQUESTER].slot(&need).unwrap().phase(),
        SlotPhase::Committed
    );
}
