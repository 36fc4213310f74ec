//! Per-topic broadcast hub. One instance is built at startup and handed
//! to the router through `AppState`; delivery is best-effort and missed
//! messages are recovered by refetching the live snapshot.

use std::collections::HashMap;

use shared::{domain::TopicId, protocol::ServerEvent};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

pub struct SessionEvents {
    capacity: usize,
    channels: Mutex<HashMap<TopicId, broadcast::Sender<ServerEvent>>>,
}

impl SessionEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the topic's channel, creating it on first use. Joining is
    /// idempotent; each call yields an independent receiver.
    pub async fn subscribe(&self, topic_id: TopicId) -> broadcast::Receiver<ServerEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(topic_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Fans the event out to current subscribers. A topic nobody listens
    /// to is a no-op sink; a channel whose last receiver is gone gets
    /// pruned here.
    pub async fn publish(&self, topic_id: TopicId, event: ServerEvent) {
        let mut channels = self.channels.lock().await;
        let Some(tx) = channels.get(&topic_id) else {
            return;
        };
        if tx.send(event).is_err() {
            channels.remove(&topic_id);
            debug!(topic_id = topic_id.0, "pruned idle session channel");
        }
    }

    pub async fn subscriber_count(&self, topic_id: TopicId) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&topic_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
