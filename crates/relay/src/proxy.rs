use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::node_conn::NodeHandle;

/// Local TCP read buffer size. One read becomes at most one DATA envelope,
/// keeping individual frames small enough not to starve other bridges.
const READ_CHUNK: usize = 16 * 1024;

/// Exposes one bridge as `127.0.0.1:port` so off-the-shelf media clients
/// (ffmpeg, RTSP libraries) can talk to the remote service.
///
/// Accepts a single connection. Bytes read locally become DATA envelopes;
/// payloads arriving on the bridge sink are written back to the socket.
/// Closing the proxy closes both the local socket and the bridge.
pub struct BridgeTcpProxy {
    pub addr: SocketAddr,
    pub bridge_id: String,
    node: Arc<NodeHandle>,
    task: tokio::task::JoinHandle<()>,
}

impl BridgeTcpProxy {
    pub async fn bind(node: Arc<NodeHandle>, bridge_id: String) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("Failed to bind loopback listener")?;
        let addr = listener.local_addr()?;

        let sink = node
            .register_bridge_sink(&bridge_id)
            .await
            .with_context(|| format!("unknown bridge {bridge_id}"))?;

        let task = tokio::spawn(run_proxy(
            listener,
            Arc::clone(&node),
            bridge_id.clone(),
            sink,
        ));

        tracing::debug!(%bridge_id, %addr, "Bridge TCP proxy listening");
        Ok(Self {
            addr,
            bridge_id,
            node,
            task,
        })
    }

    /// Tear down the proxy and the bridge behind it.
    pub async fn close(self) {
        self.task.abort();
        self.node.close_bridge(&self.bridge_id).await;
    }
}

async fn run_proxy(
    listener: TcpListener,
    node: Arc<NodeHandle>,
    bridge_id: String,
    mut sink: mpsc::Receiver<Bytes>,
) {
    let (stream, peer) = match listener.accept().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(%bridge_id, "Proxy accept failed: {e}");
            node.close_bridge(&bridge_id).await;
            return;
        }
    };
    tracing::debug!(%bridge_id, %peer, "Proxy client connected");
    // Single-client listener; further connects queue in the backlog and die
    // with the proxy.
    drop(listener);

    let (mut local_read, mut local_write) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            result = local_read.read_buf(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(%bridge_id, "Proxy client closed");
                        break;
                    }
                    Ok(_) => {
                        let payload = buf.split().freeze();
                        if node.send_data(&bridge_id, payload).await.is_err() {
                            tracing::debug!(%bridge_id, "Node connection gone, closing proxy");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%bridge_id, "Proxy local read failed: {e}");
                        break;
                    }
                }
            }
            payload = sink.recv() => {
                match payload {
                    Some(bytes) => {
                        if let Err(e) = local_write.write_all(&bytes).await {
                            tracing::debug!(%bridge_id, "Proxy local write failed: {e}");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(%bridge_id, "Bridge sink closed, closing proxy");
                        break;
                    }
                }
            }
        }
    }

    node.close_bridge(&bridge_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::node_conn::{ConnCtx, NodeTable, run_node_conn};
    use crate::registry::ServiceRegistry;
    use crate::transport::Transport;
    use crate::transport::testing::pair;
    use tokio::net::TcpStream;
    use unblink_protocol::{ControlMessage, Envelope, ServiceDescriptor, ServiceKind};

    fn descriptor(id: &str, node_id: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            node_id: node_id.to_string(),
            name: "cam".to_string(),
            kind: ServiceKind::Rtsp,
            addr: "10.0.0.5".to_string(),
            port: 554,
            path: "/cam".to_string(),
            auth: None,
        }
    }

    /// Spin up a connection whose node side echoes every DATA envelope back
    /// on the same bridge, as if the dialed TCP service were an echo server.
    async fn echo_node() -> (Arc<NodeHandle>, tokio::task::JoinHandle<()>) {
        let (stream_tx, _stream_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = ConnCtx {
            db: Arc::new(Db::open_in_memory().unwrap()),
            services: Arc::new(ServiceRegistry::new()),
            nodes: Arc::new(NodeTable::new()),
            stream_events: stream_tx,
            dashboard_url: "https://dash.example".to_string(),
        };
        ctx.db.insert_user("u1", "alice@example.com").unwrap();
        let token = ctx.db.authorize_node("n1", "u1").unwrap();

        let (relay_side, mut node_side) = pair();
        let conn_task = tokio::spawn(run_node_conn(relay_side, ctx.clone()));

        node_side
            .write(&Envelope::control(ControlMessage::Register {
                node_id: "n1".to_string(),
                token: Some(token),
            }))
            .await
            .unwrap();

        let echo_task = tokio::spawn(async move {
            while let Ok(envelope) = node_side.read().await {
                if let Some(data) = envelope.data {
                    let reply = Envelope::data(data.bridge_id, data.payload);
                    if node_side.write(&reply).await.is_err() {
                        break;
                    }
                }
                // acks / connection_ready / open_bridge are ignored
            }
        });
        drop(conn_task);

        let nodes = ctx.nodes;
        let handle = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if let Some(h) = nodes.get_registered("n1").await {
                    return h;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        (handle, echo_task)
    }

    #[tokio::test]
    async fn proxy_round_trips_bytes_in_order() {
        let (node, _echo) = echo_node().await;
        let bridge_id = node.open_bridge(descriptor("s1", "n1")).await.unwrap();
        let proxy = BridgeTcpProxy::bind(Arc::clone(&node), bridge_id.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();
        client.write_all(b" WORLD").await.unwrap();

        let mut received = vec![0u8; 11];
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            client.read_exact(&mut received),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&received, b"HELLO WORLD");

        proxy.close().await;
    }

    #[tokio::test]
    async fn closing_proxy_closes_bridge() {
        let (node, _echo) = echo_node().await;
        let bridge_id = node.open_bridge(descriptor("s1", "n1")).await.unwrap();
        let proxy = BridgeTcpProxy::bind(Arc::clone(&node), bridge_id.clone())
            .await
            .unwrap();

        assert!(node.has_bridge(&bridge_id).await);
        proxy.close().await;
        assert!(!node.has_bridge(&bridge_id).await);
    }

    #[tokio::test]
    async fn client_disconnect_closes_bridge() {
        let (node, _echo) = echo_node().await;
        let bridge_id = node.open_bridge(descriptor("s1", "n1")).await.unwrap();
        let _proxy = BridgeTcpProxy::bind(Arc::clone(&node), bridge_id.clone())
            .await
            .unwrap();

        let client = TcpStream::connect(_proxy.addr).await.unwrap();
        drop(client);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while node.has_bridge(&bridge_id).await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
