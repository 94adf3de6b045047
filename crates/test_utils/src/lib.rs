#![cfg_attr(
    not(test),
    deny(clippy::todo, clippy::unimplemented, clippy::indexing_slicing)
)]
// Unlike the kernel crates, fixtures may unwrap: a broken fixture should
// fail loudly at the test site, not limp along behind a Result.

//! # Agora Test Utilities
//!
//! Deterministic fixtures for testing kernel components: seeded keypairs,
//! an envelope factory, a single-process bus, and a hand-driven clock.

pub mod clock;
pub mod fixtures;
pub mod randomness;

pub use clock::ManualClock;
pub use fixtures::{keypair, permissive_capsule, signer, EnvelopeFactory};
pub use randomness::seeded_rng;
