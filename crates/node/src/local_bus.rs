//! A single-process broadcast bus.
//!
//! The transport for tests and local clusters: every node in the process
//! subscribes to one hub, publishes fan out to everyone else. Real
//! deployments plug a distributed pub/sub fabric into the same trait.

use agora_api::{BusError, BusTransport};
use agora_types::{AgentId, Envelope};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Subscriber {
    owner: AgentId,
    tx: mpsc::Sender<Envelope>,
}

/// The shared hub. Clone it into every node, then take per-node handles.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle bound to one node identity. The handle never
    /// delivers the node's own messages back to it.
    pub fn handle(&self, owner: AgentId) -> MemoryBusHandle {
        MemoryBusHandle {
            hub: self.clone(),
            owner,
        }
    }
}

/// Per-node transport handle.
pub struct MemoryBusHandle {
    hub: MemoryBus,
    owner: AgentId,
}

#[async_trait]
impl BusTransport for MemoryBusHandle {
    async fn publish(&self, env: Envelope) -> Result<(), BusError> {
        // Snapshot receivers outside the lock; sends may suspend.
        let targets: Vec<mpsc::Sender<Envelope>> = {
            let subs = self.hub.subscribers.lock();
            subs.iter()
                .filter(|s| s.owner != self.owner)
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in targets {
            tx.send(env.clone())
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Envelope>, BusError> {
        let (tx, rx) = mpsc::channel(1024);
        self.hub.subscribers.lock().push(Subscriber {
            owner: self.owner,
            tx,
        });
        Ok(rx)
    }
}
