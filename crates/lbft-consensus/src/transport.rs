//! Outbound message delivery.
//!
//! Delivery is best-effort: the protocol tolerates loss, duplication and
//! reordering, so a transport never reports failures back to consensus.

use std::sync::Mutex;

use lbft_types::ReplicaId;

use crate::message::Message;

/// Sends envelopes to peers.
pub trait Transport: Send + Sync {
    /// Sends to one replica.
    fn send_to(&self, to: &ReplicaId, message: Message);

    /// Sends to every other replica in the cluster.
    fn broadcast(&self, message: Message);
}

/// A message captured by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    /// `None` for broadcasts.
    pub to: Option<ReplicaId>,
    pub message: Message,
}

/// In-memory transport that records outbound messages for a test harness
/// to route.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbox: Mutex<Vec<Sent>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every message sent since the last drain.
    pub fn drain(&self) -> Vec<Sent> {
        self.outbox
            .lock()
            .map(|mut outbox| std::mem::take(&mut *outbox))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.outbox.lock().map_or(0, |outbox| outbox.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, sent: Sent) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push(sent);
        }
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, to: &ReplicaId, message: Message) {
        self.push(Sent {
            to: Some(to.clone()),
            message,
        });
    }

    fn broadcast(&self, message: Message) {
        self.push(Sent { to: None, message });
    }
}
