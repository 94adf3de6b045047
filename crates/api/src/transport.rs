//! The shared-bus transport seam.

use agora_types::Envelope;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors surfaced by a bus backend.
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    /// The bus refused or failed to carry the message.
    #[error("Publish failed: {0}")]
    Publish(String),
    /// Subscription could not be established or was torn down.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// A broadcast bus carrying sealed envelopes between nodes.
///
/// Delivery is at-least-once and unordered across senders; the kernel's
/// dedup and lamport discipline absorb both. Implementations must not
/// deliver a node's own messages back to it.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publishes a sealed envelope to every other subscriber.
    async fn publish(&self, env: Envelope) -> Result<(), BusError>;

    /// Opens a subscription stream of inbound envelopes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, BusError>;
}
