//! Cross-tab/cross-process CDC fan-out (§5), kept opaque behind a trait so a
//! single-process embedding can use the in-memory default while a real
//! multi-tab host plugs in its own transport.

use doc_core::ChangeEvent;
use tokio::sync::broadcast;

/// Publishes committed CDC events outside this process. The default impl
/// just re-broadcasts in-process; nothing here assumes a specific transport.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, events: &[ChangeEvent]);
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Single-process default: a `tokio::sync::broadcast` channel. Lagging
/// subscribers drop the oldest events they haven't read (standard broadcast
/// behavior) rather than blocking publishers.
pub struct LocalBroadcaster {
    sender: broadcast::Sender<ChangeEvent>,
}

impl LocalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broadcaster for LocalBroadcaster {
    fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            // No active subscribers is routine (e.g. before the first
            // `subscribe_to_cdc` call) and not worth logging.
            let _ = self.sender.send(event.clone());
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
