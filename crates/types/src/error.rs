//! Core error types for the Agora kernel.

use crate::primitives::{AgentId, ContentHash, NeedId, TaskId};
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors from cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material could not be parsed or was the wrong length.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    /// A signature failed verification.
    #[error("Invalid signature")]
    InvalidSignature,
    /// Input to a primitive was malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The underlying backend failed.
    #[error("Crypto operation failed: {0}")]
    OperationFailed(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "CRYPTO_INVALID_KEY",
            Self::InvalidSignature => "CRYPTO_INVALID_SIGNATURE",
            Self::InvalidInput(_) => "CRYPTO_INVALID_INPUT",
            Self::OperationFailed(_) => "CRYPTO_OPERATION_FAILED",
        }
    }
}

/// Protocol-layer faults: the envelope itself is unacceptable. These are
/// dropped locally and audited, never answered on the bus.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope signature did not verify against the sender key.
    #[error("Envelope signature verification failed")]
    BadSignature,
    /// The envelope id does not match the hash of its canonical body.
    #[error("Envelope id mismatch. Expected {expected}, got {got}")]
    IdMismatch {
        expected: ContentHash,
        got: ContentHash,
    },
    /// The sender's agent id does not derive from its public key.
    #[error("Sender key/agent-id mismatch for {0}")]
    SenderKeyMismatch(AgentId),
    /// Lamport stamp is not monotone for this sender.
    #[error("Stale lamport from sender. Last seen {last}, got {got}")]
    StaleLamport { last: u64, got: u64 },
    /// The verb was published under the wrong bus capability.
    #[error("Capability mismatch: verb requires {expected:?}, envelope carries {got:?}")]
    CapabilityMismatch {
        expected: crate::envelope::Capability,
        got: crate::envelope::Capability,
    },
    /// A link fact would close a cycle in the derived graph.
    #[error("Link would create a cycle: {parent:?} -> {child:?}")]
    LinkCycle { parent: TaskId, child: TaskId },
    /// Canonical decode of a body failed.
    #[error("Codec error: {0}")]
    Codec(String),
    /// Signature machinery failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ErrorCode for ProtocolError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadSignature => "PROTO_BAD_SIGNATURE",
            Self::IdMismatch { .. } => "PROTO_ID_MISMATCH",
            Self::SenderKeyMismatch(_) => "PROTO_SENDER_KEY_MISMATCH",
            Self::StaleLamport { .. } => "PROTO_STALE_LAMPORT",
            Self::CapabilityMismatch { .. } => "PROTO_CAPABILITY_MISMATCH",
            Self::LinkCycle { .. } => "PROTO_LINK_CYCLE",
            Self::Codec(_) => "PROTO_CODEC",
            Self::Crypto(_) => "PROTO_CRYPTO",
        }
    }
}

/// Policy-gate outcomes that refuse a message or an action. Surfaced to the
/// sender as a typed REJECT so it can back off.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The capsule evaluated to deny.
    #[error("Denied by policy: {reasons:?}")]
    Denied { reasons: Vec<String> },
    /// Evaluation ran out of gas; treated as deny.
    #[error("Policy evaluation exhausted its gas budget")]
    GasExhausted,
    /// The capsule targets a different evaluator build.
    #[error("Policy engine mismatch. Capsule targets {expected}, evaluator is {got}")]
    EngineMismatch {
        expected: ContentHash,
        got: ContentHash,
    },
    /// A budget bound in the capsule was exceeded.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),
    /// The referenced capsule could not be fetched or decoded.
    #[error("Policy capsule unavailable: {0}")]
    CapsuleUnavailable(ContentHash),
    /// The capsule is structurally invalid.
    #[error("Invalid policy capsule: {0}")]
    InvalidCapsule(String),
    /// The capsule has been quarantined after a digest divergence.
    #[error("Policy capsule quarantined: {0}")]
    Quarantined(ContentHash),
}

impl ErrorCode for PolicyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "POLICY_DENIED",
            Self::GasExhausted => "POLICY_GAS_EXHAUSTED",
            Self::EngineMismatch { .. } => "POLICY_ENGINE_MISMATCH",
            Self::BudgetExceeded(_) => "POLICY_BUDGET_EXCEEDED",
            Self::CapsuleUnavailable(_) => "POLICY_CAPSULE_UNAVAILABLE",
            Self::InvalidCapsule(_) => "POLICY_CAPSULE_INVALID",
            Self::Quarantined(_) => "POLICY_CAPSULE_QUARANTINED",
        }
    }
}

/// Faults in the negotiation lifecycle and its quorums.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A mutating verb carried an epoch older than the slot's.
    #[error("Stale epoch for {need:?}. Current {current}, got {got}")]
    StaleEpoch {
        need: NeedId,
        current: u64,
        got: u64,
    },
    /// The fencing token does not match the active lease.
    #[error("Fencing token mismatch. Expected {expected}, got {got}")]
    FencingMismatch { expected: u64, got: u64 },
    /// The verb is not legal in the slot's current phase.
    #[error("Invalid transition: {verb} in phase {phase}")]
    InvalidTransition {
        verb: &'static str,
        phase: &'static str,
    },
    /// A lease is already held by another agent.
    #[error("Lease held by {holder:?}")]
    LeaseHeld { holder: AgentId },
    /// The acting agent does not hold the lease.
    #[error("Sender does not hold the lease")]
    NotLeaseHolder,
    /// The bid or challenge window has already closed.
    #[error("Window closed at {closed_at}, message stamped {got}")]
    WindowClosed { closed_at: u64, got: u64 },
    /// The need slot is unknown on this node.
    #[error("Unknown need slot: {0}")]
    UnknownNeed(NeedId),
    /// The task is unknown on this node.
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),
    /// A verifier attested the same subject twice.
    #[error("Duplicate attestation from {0:?}")]
    DuplicateAttestation(AgentId),
    /// A committee violated a diversity cap and must be recomposed.
    #[error("Committee diversity violation: {0}")]
    DiversityViolation(String),
    /// A challenge was malformed or its proof did not hold.
    #[error("Challenge rejected: {0}")]
    ChallengeRejected(String),
}

impl ErrorCode for NegotiationError {
    fn code(&self) -> &'static str {
        match self {
            Self::StaleEpoch { .. } => "NEGO_STALE_EPOCH",
            Self::FencingMismatch { .. } => "NEGO_FENCING_MISMATCH",
            Self::InvalidTransition { .. } => "NEGO_INVALID_TRANSITION",
            Self::LeaseHeld { .. } => "NEGO_LEASE_HELD",
            Self::NotLeaseHolder => "NEGO_NOT_LEASE_HOLDER",
            Self::WindowClosed { .. } => "NEGO_WINDOW_CLOSED",
            Self::UnknownNeed(_) => "NEGO_UNKNOWN_NEED",
            Self::UnknownTask(_) => "NEGO_UNKNOWN_TASK",
            Self::DuplicateAttestation(_) => "NEGO_DUPLICATE_ATTESTATION",
            Self::DiversityViolation(_) => "NEGO_DIVERSITY_VIOLATION",
            Self::ChallengeRejected(_) => "NEGO_CHALLENGE_REJECTED",
        }
    }
}

/// Faults in the economic ledger. Every failed operation leaves balances
/// untouched.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Checked arithmetic overflowed.
    #[error("Ledger arithmetic overflow")]
    Overflow,
    /// An account cannot cover the requested debit.
    #[error("Insufficient funds for {account:?}: need {needed}, have {available}")]
    InsufficientFunds {
        account: AgentId,
        needed: u64,
        available: u64,
    },
    /// An account cannot cover the requested stake debit.
    #[error("Insufficient stake for {account:?}: need {needed}, have {available}")]
    InsufficientStake {
        account: AgentId,
        needed: u64,
        available: u64,
    },
    /// The account does not exist.
    #[error("Unknown account: {0}")]
    UnknownAccount(AgentId),
    /// Mint attempted without an authorized minter signature.
    #[error("Mint not authorized")]
    UnauthorizedMint,
    /// No escrow row exists for the key.
    #[error("Escrow row not found")]
    EscrowNotFound,
    /// The escrow row was already released or refunded.
    #[error("Escrow already released")]
    AlreadyReleased,
    /// A challenger bond is below the class-weighted minimum.
    #[error("Bond too small: required {required}, got {got}")]
    BondTooSmall { required: u64, got: u64 },
    /// A reallocation split does not sum to 10 000 basis points.
    #[error("Invalid reallocation split: {0}")]
    InvalidSplit(String),
}

impl ErrorCode for LedgerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Overflow => "LEDGER_OVERFLOW",
            Self::InsufficientFunds { .. } => "LEDGER_INSUFFICIENT_FUNDS",
            Self::InsufficientStake { .. } => "LEDGER_INSUFFICIENT_STAKE",
            Self::UnknownAccount(_) => "LEDGER_UNKNOWN_ACCOUNT",
            Self::UnauthorizedMint => "LEDGER_UNAUTHORIZED_MINT",
            Self::EscrowNotFound => "LEDGER_ESCROW_NOT_FOUND",
            Self::AlreadyReleased => "LEDGER_ALREADY_RELEASED",
            Self::BondTooSmall { .. } => "LEDGER_BOND_TOO_SMALL",
            Self::InvalidSplit(_) => "LEDGER_INVALID_SPLIT",
        }
    }
}

/// Persistence faults. These halt ingestion and surface to the operator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing file or directory failed.
    #[error("Storage I/O error: {0}")]
    Io(String),
    /// A record failed its integrity check on read.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "STORAGE_IO",
            Self::Corrupt(_) => "STORAGE_CORRUPT",
        }
    }
}

/// Fatal audit events. The affected object is quarantined; the task cannot
/// advance until an operator intervenes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// Two verifiers produced different digests for identical policy inputs.
    #[error("Policy digest divergence on {task:?}: {left} vs {right}")]
    DigestDivergence {
        task: TaskId,
        left: ContentHash,
        right: ContentHash,
    },
    /// A checkpoint root did not match the locally derived view.
    #[error("Checkpoint root mismatch at epoch {epoch}: expected {expected}, got {got}")]
    CheckpointMismatch {
        epoch: u64,
        expected: ContentHash,
        got: ContentHash,
    },
}

impl ErrorCode for IntegrityError {
    fn code(&self) -> &'static str {
        match self {
            Self::DigestDivergence { .. } => "INTEGRITY_DIGEST_DIVERGENCE",
            Self::CheckpointMismatch { .. } => "INTEGRITY_CHECKPOINT_MISMATCH",
        }
    }
}
