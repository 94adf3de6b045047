#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing
    )
)]

//! Cryptographic identity and hashing for the Agora kernel.
//!
//! Ed25519 signatures and SHA-256 content addressing, both backed by
//! `dcrypt`. Envelope sealing and verification live here so that every
//! component shares one definition of "this message is authentic".

pub mod error;
pub mod hash;
pub mod key_store;
pub mod seal;
pub mod sign;

pub use error::CryptoError;
pub use hash::{content_hash, sha256};
pub use seal::{agent_id_from_pubkey, verify_envelope, Signer};
pub use sign::Ed25519Keypair;
