//! Local error types for the `agora-crypto` crate.

// Re-export the canonical error type from the types crate.
pub use agora_types::error::CryptoError;
