use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-user broadcast of the events that concern them.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's events. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, user_id: UserId, event: &Event) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last listener went away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before - self.channels.len()
    }
}
