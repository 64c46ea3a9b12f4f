//! In-process event bus. The spec's external collaborators (admin UI,
//! REST/MCP surfaces) are out of scope, so a `tokio::sync::broadcast`
//! channel is all the pub/sub primitive this crate needs internally.

use tokio::sync::broadcast;

use crate::model::{FeedFetched, RunStateChanged};

#[derive(Debug, Clone)]
pub enum Event {
    FeedFetched(FeedFetched),
    RunStateChanged(RunStateChanged),
}

/// Shared handle passed to components that need to publish or subscribe.
/// Cloning is cheap (it clones the underlying `Sender`).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors (no active subscribers) are ignored —
    /// matches the teacher's fire-and-forget logging of best-effort
    /// notifications.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
