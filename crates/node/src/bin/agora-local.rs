//! A single-process Agora cluster over the in-memory bus.
//!
//! Spins up one requester, one worker, and three staked verifiers, runs a
//! need through propose → decide → claim → commit → attest → finalize,
//! and prints the resulting ledger standing. An optional TOML config path
//! may be given as the first argument.

use agora_cas::MemoryStore;
use agora_crypto::{Ed25519Keypair, Signer};
use agora_ledger::{Ledger, MintOrder};
use agora_node::{local_bus::MemoryBus, Node, NodeRole};
use agora_router::AdmissionProof;
use agora_types::config::KernelConfig;
use agora_types::manifest::{CandidateProfile, CapabilityDescriptor};
use agora_types::{AgentId, NeedId, ProposalId, ThreadId, Verdict};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    agora_telemetry::init_tracing()?;

    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path))?;
            toml::from_str::<KernelConfig>(&raw).context("parsing config")?
        }
        None => KernelConfig::default(),
    };
    // Keep the demo brisk regardless of production defaults.
    config.bid_window_ms = config.bid_window_ms.min(1_000);
    config.t_challenge_ms = config.t_challenge_ms.min(2_000);

    let bus = MemoryBus::new();
    let cas = Arc::new(MemoryStore::new());
    let clock: Arc<dyn agora_api::TimeSource> = Arc::new(agora_api::clock::SystemTimeSource);
    let thread = ThreadId([0x42; 32]);
    let capsule = demo_capsule();

    // Identities: requester, worker, three verifiers, one minter.
    let signers: Vec<Signer> = (1u8..=5)
        .map(|seed| Ed25519Keypair::from_seed(&[seed; 32]).and_then(Signer::new))
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow!("fixture identities: {}", e))?;
    let minter = Ed25519Keypair::from_seed(&[9; 32]).map_err(|e| anyhow!("minter key: {}", e))?;
    let minter_id = agora_crypto::agent_id_from_pubkey(&minter.public_bytes())
        .map_err(|e| anyhow!("minter id: {}", e))?;

    let ids: Vec<AgentId> = signers.iter().map(Signer::agent_id).collect();
    let verifier_set: BTreeSet<AgentId> = ids.iter().skip(2).copied().collect();

    // A shared genesis ledger: everyone funded, verifiers staked.
    let mut genesis = Ledger::new();
    genesis
        .register_minter(minter_id)
        .map_err(|e| anyhow!("genesis minter: {}", e))?;
    for (i, id) in ids.iter().enumerate() {
        let order = MintOrder {
            to: *id,
            amount: 1_000,
            nonce: i as u64 + 1,
        };
        let sig = minter
            .sign(&order.signing_bytes().map_err(|e| anyhow!("{}", e))?)
            .map_err(|e| anyhow!("mint sign: {}", e))?;
        genesis
            .mint(&order, &minter.public_bytes(), &sig)
            .map_err(|e| anyhow!("genesis mint: {}", e))?;
    }
    for v in &verifier_set {
        genesis
            .bond_stake(*v, 200)
            .map_err(|e| anyhow!("genesis stake: {}", e))?;
    }

    let mut nodes: Vec<Arc<Node>> = Vec::new();
    for (i, signer) in signers.into_iter().enumerate() {
        let role = if i >= 2 {
            NodeRole::Verifier
        } else {
            NodeRole::Participant
        };
        let id = signer.agent_id();
        let node = Arc::new(Node::new(
            signer,
            role,
            config.clone(),
            verifier_set.clone(),
            genesis.clone(),
            capsule.clone(),
            thread,
            Arc::new(bus.handle(id)),
            cas.clone(),
            clock.clone(),
        )?);
        tokio::spawn(Arc::clone(&node).run());
        nodes.push(node);
    }
    let (requester, worker) = (&nodes[0], &nodes[1]);
    let verifiers = &nodes[2..];

    // Routing: admit the verifiers as staked candidates and assemble the
    // committee that will score this task type.
    for (i, v) in verifiers.iter().enumerate() {
        let profile = CandidateProfile {
            agent_id: v.agent_id(),
            capability: CapabilityDescriptor {
                schema_in: "task/v1".into(),
                schema_out: "result/v1".into(),
                tags: vec!["summarize".into()],
                price: 5,
                pubkey: vec![],
                version: "1.0.0".into(),
            },
            org: format!("org-{}", i),
            asn: 64_500 + i as u32,
            region: ["eu", "us", "ap"][i % 3].into(),
            identity_cluster: i as u64,
            reputation: 1.0,
            p95_latency_ms: 120,
            stake: 200,
            domain_fit: 0.6,
            last_active_epoch: 1,
        };
        requester.register_candidate(profile, &AdmissionProof::Stake { bonded: 200 })?;
    }
    let (committee, canary) = requester.select_committee("summarize", 100, 3, 1, 10)?;
    println!("verifier committee: {:?} (canary: {:?})", committee, canary);

    // One full lifecycle. The stages pause briefly so bus deliveries
    // settle before the next step depends on them.
    let need = NeedId([0x01; 32]);
    let proposal = ProposalId([0x02; 32]);
    requester.publish_need(need, 100, "summarize").await?;
    settle().await;
    worker.propose(need, 1, proposal, 40).await?;
    settle().await;
    for v in verifiers.iter().take(2) {
        v.attest_plan(need, 1, proposal).await?;
    }
    settle().await;

    let task = proposal.root_task();
    worker.claim(need, 1, task).await?;
    settle().await;
    let token = worker
        .with_state(|s| s.slot(&need).and_then(|slot| slot.lease().map(|l| l.fencing_token)))
        .ok_or_else(|| anyhow!("lease not granted"))?;
    worker
        .commit(need, 1, task, token, 20, &[b"summary: the mesh works"])
        .await?;
    settle().await;
    for v in verifiers {
        v.attest(task, Verdict::Pass).await?;
    }

    // Let the challenge window elapse and the timers finalize.
    tokio::time::sleep(std::time::Duration::from_millis(config.t_challenge_ms + 500)).await;

    let phase = requester.with_state(|s| s.slot(&need).map(|slot| slot.phase()));
    println!("slot phase: {:?}", phase);
    for (label, node) in [("requester", requester), ("worker", worker)] {
        let id = node.agent_id();
        let (balance, stake) = node.with_state(|s| (s.ledger.balance(&id), s.ledger.stake(&id)));
        println!("{:10} balance={} stake={}", label, balance, stake);
    }
    for (i, v) in verifiers.iter().enumerate() {
        let id = v.agent_id();
        let balance = v.with_state(|s| s.ledger.balance(&id));
        println!("verifier-{} balance={}", i, balance);
    }
    Ok(())
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}

fn demo_capsule() -> agora_policy::PolicyCapsule {
    agora_policy::PolicyCapsule {
        engine_hash: agora_policy::engine_hash(),
        schema_version: 1,
        rules: vec![],
        default_verdict: agora_policy::DefaultVerdict::AllowAll,
        budgets: agora_policy::Budgets {
            tokens: 1_000_000,
            credits: 10_000,
            msgs: 10_000,
            ttl_ms: 600_000,
        },
        challenge_split: Default::default(),
        retry_budget: 5,
        conformance_vector: None,
        gas_limit: 10_000,
    }
}
