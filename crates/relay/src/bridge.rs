use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use unblink_protocol::ServiceDescriptor;

/// Inbound queue depth per bridge. A consumer that falls this far behind
/// starts losing payloads rather than stalling the connection's read loop.
pub const BRIDGE_SINK_CAPACITY: usize = 256;

/// Outcome of routing one inbound DATA payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Bridge exists but nothing has registered a sink yet
    NoSink,
    /// Bridge id is not in the table
    UnknownBridge,
    /// Sink queue is full; the payload was dropped
    SinkFull,
}

struct BridgeEntry {
    service: ServiceDescriptor,
    sink: Option<mpsc::Sender<Bytes>>,
    bytes_in: AtomicU64,
    msgs_in: AtomicU64,
}

/// Snapshot of one bridge's counters, for logs and diagnostics.
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub service_id: String,
    pub bytes_in: u64,
    pub msgs_in: u64,
}

/// Per-connection map of bridge id → (service, inbound sink).
///
/// Owned exclusively by one node connection; every bridge dies with it.
pub struct BridgeTable {
    inner: RwLock<HashMap<String, BridgeEntry>>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a bridge. Returns false if the id is already present.
    pub async fn insert(&self, bridge_id: &str, service: ServiceDescriptor) -> bool {
        let mut inner = self.inner.write().await;
        if inner.contains_key(bridge_id) {
            return false;
        }
        inner.insert(
            bridge_id.to_string(),
            BridgeEntry {
                service,
                sink: None,
                bytes_in: AtomicU64::new(0),
                msgs_in: AtomicU64::new(0),
            },
        );
        true
    }

    /// Attach a sink to a bridge and hand back the consuming end.
    ///
    /// All inbound DATA payloads for the bridge are delivered to it in
    /// order. Replaces any previous sink; returns None for unknown bridges.
    pub async fn register_sink(&self, bridge_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(bridge_id)?;
        let (tx, rx) = mpsc::channel(BRIDGE_SINK_CAPACITY);
        entry.sink = Some(tx);
        Some(rx)
    }

    /// Route one inbound payload to the bridge's sink, if any.
    pub async fn deliver(&self, bridge_id: &str, payload: Bytes) -> Delivery {
        let inner = self.inner.read().await;
        let Some(entry) = inner.get(bridge_id) else {
            return Delivery::UnknownBridge;
        };
        entry.msgs_in.fetch_add(1, Ordering::Relaxed);
        entry
            .bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        let Some(sink) = &entry.sink else {
            return Delivery::NoSink;
        };
        match sink.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::SinkFull,
            // Receiver gone: equivalent to no sink being registered
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoSink,
        }
    }

    /// Destroy a bridge. Dropping the sender closes the sink, which wakes
    /// any consumer blocked on it. Returns false for unknown bridges.
    pub async fn remove(&self, bridge_id: &str) -> bool {
        self.inner.write().await.remove(bridge_id).is_some()
    }

    /// Destroy every bridge; called when the owning connection dies.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    #[cfg(test)]
    pub async fn contains(&self, bridge_id: &str) -> bool {
        self.inner.read().await.contains_key(bridge_id)
    }

    pub async fn stats(&self, bridge_id: &str) -> Option<BridgeStats> {
        let inner = self.inner.read().await;
        let entry = inner.get(bridge_id)?;
        Some(BridgeStats {
            service_id: entry.service.id.clone(),
            bytes_in: entry.bytes_in.load(Ordering::Relaxed),
            msgs_in: entry.msgs_in.load(Ordering::Relaxed),
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unblink_protocol::ServiceKind;

    fn service(id: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            node_id: "node-1".to_string(),
            name: "cam".to_string(),
            kind: ServiceKind::Rtsp,
            addr: "10.0.0.5".to_string(),
            port: 554,
            path: "/cam".to_string(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn insert_is_unique_per_id() {
        let table = BridgeTable::new();
        assert!(table.insert("b-1", service("s")).await);
        assert!(!table.insert("b-1", service("s")).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn delivery_preserves_order() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s")).await;
        let mut rx = table.register_sink("b-1").await.unwrap();

        for i in 0..10u8 {
            assert_eq!(
                table.deliver("b-1", Bytes::from(vec![i])).await,
                Delivery::Delivered
            );
        }
        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn delivery_isolated_between_bridges() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s1")).await;
        table.insert("b-2", service("s2")).await;
        let mut rx1 = table.register_sink("b-1").await.unwrap();
        let mut rx2 = table.register_sink("b-2").await.unwrap();

        table.deliver("b-1", Bytes::from_static(b"one")).await;
        table.deliver("b-2", Bytes::from_static(b"two")).await;

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_bridge_reported() {
        let table = BridgeTable::new();
        assert_eq!(
            table.deliver("nope", Bytes::from_static(b"x")).await,
            Delivery::UnknownBridge
        );
    }

    #[tokio::test]
    async fn no_sink_reported_but_counted() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s")).await;
        assert_eq!(
            table.deliver("b-1", Bytes::from_static(b"xyz")).await,
            Delivery::NoSink
        );
        let stats = table.stats("b-1").await.unwrap();
        assert_eq!(stats.msgs_in, 1);
        assert_eq!(stats.bytes_in, 3);
    }

    #[tokio::test]
    async fn full_sink_drops_payload() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s")).await;
        let _rx = table.register_sink("b-1").await.unwrap();

        for _ in 0..BRIDGE_SINK_CAPACITY {
            assert_eq!(
                table.deliver("b-1", Bytes::from_static(b"x")).await,
                Delivery::Delivered
            );
        }
        assert_eq!(
            table.deliver("b-1", Bytes::from_static(b"x")).await,
            Delivery::SinkFull
        );
    }

    #[tokio::test]
    async fn remove_closes_sink() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s")).await;
        let mut rx = table.register_sink("b-1").await.unwrap();
        assert!(table.remove("b-1").await);
        assert!(rx.recv().await.is_none());
        assert!(!table.remove("b-1").await);
    }

    #[tokio::test]
    async fn clear_closes_every_sink() {
        let table = BridgeTable::new();
        table.insert("b-1", service("s1")).await;
        table.insert("b-2", service("s2")).await;
        let mut rx1 = table.register_sink("b-1").await.unwrap();
        let mut rx2 = table.register_sink("b-2").await.unwrap();
        table.clear().await;
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
        assert_eq!(table.len().await, 0);
    }
}
