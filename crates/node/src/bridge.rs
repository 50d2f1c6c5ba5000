//! Node-side bridges: one local TCP connection per OPEN_BRIDGE, with a
//! pump in each direction.
//!
//! TCP reads become DATA envelopes on the shared outbox (which keeps them
//! ordered); inbound DATA payloads are queued to a writer task per bridge.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use unblink_protocol::{Envelope, ServiceDescriptor};

/// Queue depth of inbound payloads awaiting the local TCP write.
const TCP_WRITE_QUEUE: usize = 256;

/// Local TCP read chunk size; one read becomes at most one DATA envelope.
const READ_CHUNK: usize = 16 * 1024;

/// Internal notifications from pump tasks back to the client loop.
#[derive(Debug)]
pub enum BridgeNotice {
    /// Local TCP ended; the relay should see CLOSE_BRIDGE
    Closed(String),
}

struct BridgeHandle {
    to_tcp: mpsc::Sender<Bytes>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// All live bridges of one relay connection. Owned by the client loop;
/// none survive a reconnect.
pub struct BridgeSet {
    outbox: mpsc::Sender<Envelope>,
    notices: mpsc::UnboundedSender<BridgeNotice>,
    bridges: HashMap<String, BridgeHandle>,
}

impl BridgeSet {
    pub fn new(
        outbox: mpsc::Sender<Envelope>,
        notices: mpsc::UnboundedSender<BridgeNotice>,
    ) -> Self {
        Self {
            outbox,
            notices,
            bridges: HashMap::new(),
        }
    }

    /// Dial the service and start both pumps.
    pub async fn open(&mut self, bridge_id: String, service: &ServiceDescriptor) -> Result<()> {
        if self.bridges.contains_key(&bridge_id) {
            anyhow::bail!("bridge {bridge_id} already open");
        }
        let stream = TcpStream::connect((service.addr.as_str(), service.port))
            .await
            .with_context(|| {
                format!("Failed to dial {}:{}", service.addr, service.port)
            })?;
        let (mut tcp_read, mut tcp_write) = stream.into_split();

        let (to_tcp, mut from_relay) = mpsc::channel::<Bytes>(TCP_WRITE_QUEUE);

        // DATA → TCP
        let writer_bridge_id = bridge_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(payload) = from_relay.recv().await {
                if let Err(e) = tcp_write.write_all(&payload).await {
                    debug!(bridge_id = %writer_bridge_id, "Local TCP write failed: {e}");
                    break;
                }
            }
        });

        // TCP → DATA
        let outbox = self.outbox.clone();
        let notices = self.notices.clone();
        let reader_bridge_id = bridge_id.clone();
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                match tcp_read.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(bridge_id = %reader_bridge_id, "Local TCP closed");
                        break;
                    }
                    Ok(_) => {
                        let payload = buf.split().freeze();
                        if outbox
                            .send(Envelope::data(&reader_bridge_id, payload))
                            .await
                            .is_err()
                        {
                            // Relay connection is gone; the client loop is
                            // already tearing everything down
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(bridge_id = %reader_bridge_id, "Local TCP read failed: {e}");
                        break;
                    }
                }
            }
            let _ = notices.send(BridgeNotice::Closed(reader_bridge_id));
        });

        debug!(%bridge_id, addr = %service.addr, port = service.port, "Bridge opened");
        self.bridges.insert(
            bridge_id,
            BridgeHandle {
                to_tcp,
                reader,
                writer,
            },
        );
        Ok(())
    }

    /// Queue inbound payload bytes for the bridge's TCP socket.
    pub fn deliver(&self, bridge_id: &str, payload: Bytes) {
        let Some(handle) = self.bridges.get(bridge_id) else {
            debug!(%bridge_id, "DATA for unknown bridge, dropped");
            return;
        };
        match handle.to_tcp.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%bridge_id, "TCP write queue full, payload dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%bridge_id, "TCP writer gone, payload dropped");
            }
        }
    }

    /// Stop the pumps and close the TCP connection.
    pub fn close(&mut self, bridge_id: &str) {
        if let Some(handle) = self.bridges.remove(bridge_id) {
            handle.reader.abort();
            handle.writer.abort();
            debug!(%bridge_id, "Bridge closed");
        }
    }

    /// Tear down every bridge (connection lost or shutting down).
    pub fn close_all(&mut self) {
        for (bridge_id, handle) in self.bridges.drain() {
            handle.reader.abort();
            handle.writer.abort();
            debug!(%bridge_id, "Bridge closed");
        }
    }

    #[cfg(test)]
    pub fn contains(&self, bridge_id: &str) -> bool {
        self.bridges.contains_key(bridge_id)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use unblink_protocol::ServiceKind;

    async fn echo_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        (addr, task)
    }

    fn service_at(addr: std::net::SocketAddr) -> ServiceDescriptor {
        ServiceDescriptor {
            id: "s1".to_string(),
            node_id: "n1".to_string(),
            name: "cam".to_string(),
            kind: ServiceKind::Rtsp,
            addr: addr.ip().to_string(),
            port: addr.port(),
            path: "/cam".to_string(),
            auth: None,
        }
    }

    fn bridge_set() -> (
        BridgeSet,
        mpsc::Receiver<Envelope>,
        mpsc::UnboundedReceiver<BridgeNotice>,
    ) {
        let (outbox_tx, outbox_rx) = mpsc::channel(64);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        (BridgeSet::new(outbox_tx, notice_tx), outbox_rx, notice_rx)
    }

    #[tokio::test]
    async fn bridge_echoes_through_local_tcp() {
        let (addr, _listener) = echo_listener().await;
        let (mut bridges, mut outbox, _notices) = bridge_set();

        bridges
            .open("b-1".to_string(), &service_at(addr))
            .await
            .unwrap();
        bridges.deliver("b-1", Bytes::from_static(b"HELLO"));

        let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), outbox.recv())
            .await
            .unwrap()
            .unwrap();
        let data = envelope.data.expect("data envelope");
        assert_eq!(data.bridge_id, "b-1");
        assert_eq!(&data.payload[..], b"HELLO");
    }

    #[tokio::test]
    async fn payload_order_is_preserved() {
        let (addr, _listener) = echo_listener().await;
        let (mut bridges, mut outbox, _notices) = bridge_set();
        bridges
            .open("b-1".to_string(), &service_at(addr))
            .await
            .unwrap();

        for i in 0..20u8 {
            bridges.deliver("b-1", Bytes::from(vec![i]));
        }

        // The echo may coalesce reads; collect until all 20 bytes are back.
        let mut received = Vec::new();
        while received.len() < 20 {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), outbox.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&envelope.data.unwrap().payload);
        }
        assert_eq!(received, (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let (mut bridges, _outbox, _notices) = bridge_set();
        // A port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(
            bridges
                .open("b-1".to_string(), &service_at(addr))
                .await
                .is_err()
        );
        assert_eq!(bridges.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_bridge_id_rejected() {
        let (addr, _listener) = echo_listener().await;
        let (mut bridges, _outbox, _notices) = bridge_set();
        bridges
            .open("b-1".to_string(), &service_at(addr))
            .await
            .unwrap();
        assert!(
            bridges
                .open("b-1".to_string(), &service_at(addr))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn remote_close_surfaces_as_notice() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream); // immediately hang up
        });

        let (mut bridges, _outbox, mut notices) = bridge_set();
        bridges
            .open("b-1".to_string(), &service_at(addr))
            .await
            .unwrap();
        accept.await.unwrap();

        match tokio::time::timeout(std::time::Duration::from_secs(1), notices.recv())
            .await
            .unwrap()
        {
            Some(BridgeNotice::Closed(bridge_id)) => assert_eq!(bridge_id, "b-1"),
            other => panic!("expected Closed notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_all_empties_the_set() {
        let (addr, _listener) = echo_listener().await;
        let (mut bridges, _outbox, _notices) = bridge_set();
        bridges
            .open("b-1".to_string(), &service_at(addr))
            .await
            .unwrap();
        bridges
            .open("b-2".to_string(), &service_at(addr))
            .await
            .unwrap();
        assert_eq!(bridges.len(), 2);
        bridges.close_all();
        assert_eq!(bridges.len(), 0);
        assert!(!bridges.contains("b-1"));
    }
}
