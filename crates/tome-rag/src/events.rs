//! Broadcast channel for retrieval events.
//!
//! Every fetch and import is published here so that hosts can observe
//! them without polling the bridge.

use tokio::sync::broadcast;

use crate::document::Document;

/// Subscribers that fall behind by more than this many events miss them.
const CHANNEL_CAPACITY: usize = 256;

/// Something the service did.
#[derive(Clone, Debug, PartialEq)]
pub enum RetrievalEvent {
    /// Documents were fetched for a prompt.
    DocumentsFetched {
        prompt: String,
        documents: Vec<Document>,
    },
    /// A dataset replaced the index.
    Imported { nodes: usize, layers: usize },
}

/// Hub for publishing and subscribing to retrieval events.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<RetrievalEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: RetrievalEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetrievalEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
