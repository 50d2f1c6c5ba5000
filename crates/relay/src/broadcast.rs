use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Per-subscriber queue depth.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

/// Consecutive overflows after which a slow subscriber is dropped outright.
const OVERFLOW_DROP_THRESHOLD: u32 = 8;

/// A stored event on its way to dashboard subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: String,
    pub node_id: String,
    pub service_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

struct Subscriber {
    id: Uuid,
    node_id: String,
    /// None = all events for the node
    service_id: Option<String>,
    tx: mpsc::Sender<StoredEvent>,
    overflows: u32,
}

impl Subscriber {
    fn wants(&self, event: &StoredEvent) -> bool {
        self.node_id == event.node_id
            && self
                .service_id
                .as_ref()
                .is_none_or(|filter| filter == &event.service_id)
    }
}

/// Per-(node, service) fan-out of stored events back to dashboard clients.
///
/// Bounded channels per subscriber; one that stays full through
/// `OVERFLOW_DROP_THRESHOLD` consecutive events is removed so it cannot
/// pin event memory for everyone else.
pub struct EventBroadcaster {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to a node's events, optionally narrowed to one service.
    pub async fn subscribe(
        &self,
        node_id: &str,
        service_id: Option<String>,
    ) -> (Uuid, mpsc::Receiver<StoredEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers.write().await.push(Subscriber {
            id,
            node_id: node_id.to_string(),
            service_id,
            tx,
            overflows: 0,
        });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    /// Deliver an event to every matching subscriber.
    pub async fn publish(&self, event: StoredEvent) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain_mut(|subscriber| {
            if !subscriber.wants(&event) {
                return true;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    subscriber.overflows = 0;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.overflows += 1;
                    if subscriber.overflows >= OVERFLOW_DROP_THRESHOLD {
                        tracing::warn!(
                            subscriber = %subscriber.id,
                            node_id = %subscriber.node_id,
                            "Dropping subscriber that cannot keep up"
                        );
                        false
                    } else {
                        tracing::debug!(
                            subscriber = %subscriber.id,
                            "Subscriber queue full, event dropped"
                        );
                        true
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
