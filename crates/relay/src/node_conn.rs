use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use unblink_protocol::{ControlMessage, Envelope, RegisterErrorCode, ServiceDescriptor};
use uuid::Uuid;

use crate::bridge::{BridgeTable, Delivery};
use crate::db::Db;
use crate::registry::{RegisteredService, ServiceRegistry};
use crate::streams::StreamEvent;
use crate::transport::Transport;

/// Outbound envelope queue per connection. All writes to the transport are
/// funneled through it, which serializes them.
const OUTBOX_CAPACITY: usize = 1024;

/// Shared handle to one live node connection.
///
/// Everything the rest of the relay may do to a node goes through here:
/// push an auth token, open/close bridges, send data, attach sinks.
pub struct NodeHandle {
    pub conn_id: Uuid,
    pub node_id: String,
    outbox: mpsc::Sender<Envelope>,
    bridges: Arc<BridgeTable>,
    registered: AtomicBool,
}

impl NodeHandle {
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("node connection closed"))
    }

    /// Push a freshly minted registration token to a waiting node.
    pub async fn send_auth_token(&self, token: String) -> Result<()> {
        self.send(Envelope::control(ControlMessage::AuthToken { token }))
            .await
    }

    /// Open a bridge to a service on this node.
    ///
    /// The bridge is installed in the table before the OPEN_BRIDGE message is
    /// sent, so inbound DATA can never race past an unknown bridge id.
    pub async fn open_bridge(&self, service: ServiceDescriptor) -> Result<String> {
        let bridge_id = Uuid::new_v4().to_string();
        self.bridges.insert(&bridge_id, service.clone()).await;
        let envelope = Envelope::control(ControlMessage::OpenBridge {
            bridge_id: bridge_id.clone(),
            service,
        });
        if self.send(envelope).await.is_err() {
            self.bridges.remove(&bridge_id).await;
            anyhow::bail!("node connection closed");
        }
        tracing::debug!(node_id = %self.node_id, %bridge_id, "Bridge opened");
        Ok(bridge_id)
    }

    /// Destroy a bridge on both sides. Pending data is discarded.
    pub async fn close_bridge(&self, bridge_id: &str) {
        let stats = self.bridges.stats(bridge_id).await;
        if self.bridges.remove(bridge_id).await {
            let _ = self
                .send(Envelope::control(ControlMessage::CloseBridge {
                    bridge_id: bridge_id.to_string(),
                }))
                .await;
            tracing::debug!(
                node_id = %self.node_id,
                %bridge_id,
                stats = ?stats,
                "Bridge closed"
            );
        }
    }

    /// Send bytes down a bridge toward the node's TCP socket.
    pub async fn send_data(&self, bridge_id: &str, payload: Bytes) -> Result<()> {
        self.send(Envelope::data(bridge_id, payload)).await
    }

    /// Attach the inbound byte queue for a bridge.
    pub async fn register_bridge_sink(&self, bridge_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        self.bridges.register_sink(bridge_id).await
    }

    #[cfg(test)]
    pub async fn has_bridge(&self, bridge_id: &str) -> bool {
        self.bridges.contains(bridge_id).await
    }
}

/// Relay-wide map of node id → live connection handle.
///
/// A node appears here as soon as it identifies itself (even before
/// authorization completes) so the relay can push `auth_token` to it.
pub struct NodeTable {
    inner: RwLock<HashMap<String, Arc<NodeHandle>>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    async fn insert(&self, handle: Arc<NodeHandle>) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.insert(handle.node_id.clone(), handle) {
            tracing::info!(
                node_id = %previous.node_id,
                "Replaced an existing connection for this node"
            );
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.inner.read().await.get(node_id).cloned()
    }

    /// The node's handle, but only once it has registered.
    pub async fn get_registered(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.inner
            .read()
            .await
            .get(node_id)
            .filter(|h| h.is_registered())
            .cloned()
    }

    /// Remove the entry for `node_id`, but only if it still belongs to the
    /// given connection; a newer connection's entry is left alone.
    async fn remove_conn(&self, node_id: &str, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if inner.get(node_id).is_some_and(|h| h.conn_id == conn_id) {
            inner.remove(node_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Dependencies a node connection needs from the rest of the relay.
#[derive(Clone)]
pub struct ConnCtx {
    pub db: Arc<Db>,
    pub services: Arc<ServiceRegistry>,
    pub nodes: Arc<NodeTable>,
    pub stream_events: mpsc::UnboundedSender<StreamEvent>,
    pub dashboard_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauth,
    Registered,
}

enum Flow {
    Continue,
    Close,
}

struct Conn {
    conn_id: Uuid,
    phase: Phase,
    node_id: Option<String>,
    outbox: mpsc::Sender<Envelope>,
    bridges: Arc<BridgeTable>,
    ctx: ConnCtx,
}

/// Drive one node connection to completion.
///
/// Runs the protocol state machine (authorize → register → announce → serve)
/// over the given transport. Returns when the transport dies or the protocol
/// is violated; all bridges and registry entries owned by the connection are
/// destroyed on the way out.
pub(crate) async fn run_node_conn<T: Transport>(mut transport: T, ctx: ConnCtx) {
    let conn_id = Uuid::new_v4();
    let (outbox_tx, mut outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let bridges = Arc::new(BridgeTable::new());

    let mut conn = Conn {
        conn_id,
        phase: Phase::Unauth,
        node_id: None,
        outbox: outbox_tx,
        bridges,
        ctx,
    };

    tracing::debug!(%conn_id, "Node connection accepted");

    'outer: loop {
        tokio::select! {
            Some(envelope) = outbox_rx.recv() => {
                if let Err(e) = transport.write(&envelope).await {
                    tracing::debug!(%conn_id, "Node transport write failed: {e}");
                    break;
                }
            }
            result = transport.read() => {
                let envelope = match result {
                    Ok(envelope) => envelope,
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(%conn_id, "Dropping undecodable envelope: {e}");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, "Node transport closed: {e}");
                        break;
                    }
                };
                let (replies, flow) = conn.handle(envelope).await;
                for reply in replies {
                    if let Err(e) = transport.write(&reply).await {
                        tracing::debug!(%conn_id, "Node transport write failed: {e}");
                        break 'outer;
                    }
                }
                if matches!(flow, Flow::Close) {
                    break;
                }
            }
        }
    }

    transport.close().await;
    conn.teardown().await;
}

impl Conn {
    /// Process one inbound envelope. Returns the envelopes to write back in
    /// order; the ACK for this message always precedes anything it caused.
    async fn handle(&mut self, envelope: Envelope) -> (Vec<Envelope>, Flow) {
        if let Some(data) = envelope.data {
            return (Vec::new(), self.handle_data(data.bridge_id, data.payload).await);
        }
        let Some(control) = envelope.control else {
            // decode() guarantees one of the two is present
            return (Vec::new(), Flow::Continue);
        };

        if let ControlMessage::Ack { ack_msg_id } = &control {
            tracing::trace!(conn_id = %self.conn_id, %ack_msg_id, "ACK from node");
            return (Vec::new(), Flow::Continue);
        }

        let mut out = vec![Envelope::ack(&envelope.msg_id)];
        let flow = match (self.phase, control) {
            (Phase::Unauth, ControlMessage::ReqAuthorizationUrl { node_id }) => {
                self.handle_authorization_request(node_id, &mut out).await
            }
            (Phase::Unauth, ControlMessage::Register { node_id, token }) => {
                self.handle_register(node_id, token, &mut out).await
            }
            (Phase::Registered, ControlMessage::Announce { services }) => {
                self.handle_announce(services).await
            }
            (Phase::Registered, ControlMessage::CloseBridge { bridge_id }) => {
                if !self.bridges.remove(&bridge_id).await {
                    tracing::debug!(conn_id = %self.conn_id, %bridge_id, "CLOSE_BRIDGE for unknown bridge");
                }
                Flow::Continue
            }
            (phase, other) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    ?phase,
                    message = ?std::mem::discriminant(&other),
                    "Protocol violation, closing connection"
                );
                Flow::Close
            }
        };
        (out, flow)
    }

    async fn handle_data(&mut self, bridge_id: String, payload: Bytes) -> Flow {
        if self.phase != Phase::Registered {
            tracing::warn!(conn_id = %self.conn_id, "DATA before registration, closing");
            return Flow::Close;
        }
        match self.bridges.deliver(&bridge_id, payload).await {
            Delivery::Delivered => {}
            Delivery::NoSink => {
                tracing::trace!(%bridge_id, "DATA with no sink attached, dropped");
            }
            Delivery::UnknownBridge => {
                tracing::debug!(%bridge_id, "DATA for unknown bridge, dropped");
            }
            Delivery::SinkFull => {
                tracing::warn!(%bridge_id, "Bridge sink full, payload dropped");
            }
        }
        Flow::Continue
    }

    async fn handle_authorization_request(
        &mut self,
        node_id: String,
        out: &mut Vec<Envelope>,
    ) -> Flow {
        if let Err(e) = self.ctx.db.ensure_pending_node(&node_id) {
            tracing::error!(%node_id, "Failed to record pending node: {e}");
            return Flow::Close;
        }
        // Track the connection under its claimed id even before authorization
        // so the auth_token can be pushed to it once a user approves.
        self.bind(node_id.clone(), false).await;
        let auth_url = format!("{}/authorize?node={}", self.ctx.dashboard_url, node_id);
        tracing::info!(%node_id, %auth_url, "Node awaiting authorization");
        out.push(Envelope::control(ControlMessage::ResAuthorizationUrl {
            auth_url,
        }));
        Flow::Continue
    }

    async fn handle_register(
        &mut self,
        node_id: String,
        token: Option<String>,
        out: &mut Vec<Envelope>,
    ) -> Flow {
        let reject = |code: RegisterErrorCode, message: &str| {
            Envelope::control(ControlMessage::RegisterError {
                code,
                message: message.to_string(),
            })
        };

        let Some(token) = token else {
            tracing::warn!(%node_id, "REGISTER without a token");
            out.push(reject(
                RegisterErrorCode::MissingToken,
                "register requires a token",
            ));
            return Flow::Close;
        };

        let row = match self.ctx.db.node_by_token(&token) {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(%node_id, "REGISTER with unknown token");
                out.push(reject(
                    RegisterErrorCode::InvalidToken,
                    "token does not match any node",
                ));
                return Flow::Close;
            }
            Err(e) => {
                tracing::error!(%node_id, "Token lookup failed: {e}");
                return Flow::Close;
            }
        };

        if row.owner_id.is_none() {
            tracing::warn!(node_id = %row.id, "REGISTER for a node with no owner");
            out.push(reject(
                RegisterErrorCode::Unauthorized,
                "node is not associated with a user",
            ));
            return Flow::Close;
        }

        // The token is authoritative for identity; a mismatched claimed id is
        // logged but the stored id wins.
        if row.id != node_id {
            tracing::warn!(claimed = %node_id, actual = %row.id, "REGISTER id mismatch");
        }

        if let Err(e) = self.ctx.db.set_last_connected(&row.id) {
            tracing::warn!(node_id = %row.id, "Failed to update last_connected_at: {e}");
        }

        self.bind(row.id.clone(), true).await;
        self.phase = Phase::Registered;
        tracing::info!(node_id = %row.id, name = ?row.name, "Node registered");

        out.push(Envelope::control(ControlMessage::ConnectionReady {
            node_id: row.id,
            dashboard_url: self.ctx.dashboard_url.clone(),
        }));
        Flow::Continue
    }

    async fn handle_announce(&mut self, services: Vec<ServiceDescriptor>) -> Flow {
        let Some(node_id) = self.node_id.clone() else {
            return Flow::Close;
        };
        for descriptor in services {
            let service_id = descriptor.id.clone();
            if !self.ctx.services.upsert(&node_id, descriptor.clone()).await {
                continue;
            }
            if let Err(e) = self.ctx.db.upsert_service(&descriptor) {
                tracing::error!(%service_id, "Failed to persist service: {e}");
            }
            tracing::info!(%node_id, %service_id, "Service announced");
            let _ = self
                .ctx
                .stream_events
                .send(StreamEvent::ServiceAnnounced(RegisteredService {
                    descriptor,
                    node_id: node_id.clone(),
                }));
        }
        Flow::Continue
    }

    async fn bind(&mut self, node_id: String, registered: bool) {
        self.node_id = Some(node_id.clone());
        let handle = Arc::new(NodeHandle {
            conn_id: self.conn_id,
            node_id,
            outbox: self.outbox.clone(),
            bridges: Arc::clone(&self.bridges),
            registered: AtomicBool::new(registered),
        });
        self.ctx.nodes.insert(handle).await;
    }

    async fn teardown(self) {
        let open_bridges = self.bridges.len().await;
        if open_bridges > 0 {
            tracing::debug!(conn_id = %self.conn_id, open_bridges, "Destroying bridges");
        }
        self.bridges.clear().await;
        let Some(node_id) = self.node_id else {
            return;
        };
        self.ctx.nodes.remove_conn(&node_id, self.conn_id).await;
        if self.phase == Phase::Registered {
            let removed = self.ctx.services.remove_node(&node_id).await;
            tracing::info!(
                %node_id,
                services = removed.len(),
                "Node disconnected, services removed"
            );
            let _ = self
                .ctx
                .stream_events
                .send(StreamEvent::NodeDisconnected(node_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::transport::testing::{PairTransport, pair};
    use unblink_protocol::ServiceKind;

    struct Harness {
        ctx: ConnCtx,
        stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
    }

    fn harness() -> Harness {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Harness {
            ctx: ConnCtx {
                db: Arc::new(Db::open_in_memory().unwrap()),
                services: Arc::new(ServiceRegistry::new()),
                nodes: Arc::new(NodeTable::new()),
                stream_events: stream_tx,
                dashboard_url: "https://dash.example".to_string(),
            },
            stream_rx,
        }
    }

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

    /// Node-side helper around the test transport.
    struct NodeSim {
        transport: PairTransport,
    }

    impl NodeSim {
        async fn send(&mut self, control: ControlMessage) -> String {
            let envelope = Envelope::control(control);
            let msg_id = envelope.msg_id.clone();
            self.transport.write(&envelope).await.unwrap();
            msg_id
        }

        async fn send_data(&mut self, bridge_id: &str, payload: &[u8]) {
            let envelope = Envelope::data(bridge_id, Bytes::copy_from_slice(payload));
            self.transport.write(&envelope).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            tokio::time::timeout(std::time::Duration::from_secs(1), self.transport.read())
                .await
                .expect("timed out waiting for relay")
                .expect("relay closed")
        }

        async fn expect_ack(&mut self, msg_id: &str) {
            match self.recv().await.control {
                Some(ControlMessage::Ack { ack_msg_id }) => assert_eq!(ack_msg_id, msg_id),
                other => panic!("expected Ack, got {other:?}"),
            }
        }

        async fn expect_closed(&mut self) {
            let result =
                tokio::time::timeout(std::time::Duration::from_secs(1), self.transport.read())
                    .await
                    .expect("timed out waiting for close");
            assert!(matches!(result, Err(TransportError::Closed)));
        }
    }

    fn spawn_conn(harness: &Harness) -> (NodeSim, tokio::task::JoinHandle<()>) {
        let (relay_side, node_side) = pair();
        let task = tokio::spawn(run_node_conn(relay_side, harness.ctx.clone()));
        (
            NodeSim {
                transport: node_side,
            },
            task,
        )
    }

    /// Register a node end to end: authorize in the db, then REGISTER.
    async fn register(harness: &Harness, node: &mut NodeSim, node_id: &str) {
        harness.ctx.db.insert_user("u1", "alice@example.com").ok();
        let token = harness.ctx.db.authorize_node(node_id, "u1").unwrap();
        let msg_id = node
            .send(ControlMessage::Register {
                node_id: node_id.to_string(),
                token: Some(token),
            })
            .await;
        node.expect_ack(&msg_id).await;
        match node.recv().await.control {
            Some(ControlMessage::ConnectionReady {
                node_id: ready_id, ..
            }) => assert_eq!(ready_id, node_id),
            other => panic!("expected ConnectionReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn authorization_url_flow() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);

        let msg_id = node
            .send(ControlMessage::ReqAuthorizationUrl {
                node_id: "n1".to_string(),
            })
            .await;

        // ACK first, then the URL
        node.expect_ack(&msg_id).await;
        match node.recv().await.control {
            Some(ControlMessage::ResAuthorizationUrl { auth_url }) => {
                assert_eq!(auth_url, "https://dash.example/authorize?node=n1");
            }
            other => panic!("expected ResAuthorizationUrl, got {other:?}"),
        }

        // The pending node is now reachable for an auth_token push, but it
        // is not registered.
        let handle = harness.ctx.nodes.get("n1").await.unwrap();
        assert!(!handle.is_registered());
        assert!(harness.ctx.nodes.get_registered("n1").await.is_none());

        // And persisted as a pending row
        let row = harness.ctx.db.node_by_id("n1").unwrap().unwrap();
        assert!(row.owner_id.is_none());
    }

    #[tokio::test]
    async fn auth_token_pushed_over_pending_connection() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);

        let msg_id = node
            .send(ControlMessage::ReqAuthorizationUrl {
                node_id: "n1".to_string(),
            })
            .await;
        node.expect_ack(&msg_id).await;
        node.recv().await; // res_authorization_url

        // A user authorizes out of band; the relay pushes the token.
        harness.ctx.db.insert_user("u1", "alice@example.com").unwrap();
        let token = harness.ctx.db.authorize_node("n1", "u1").unwrap();
        let handle = harness.ctx.nodes.get("n1").await.unwrap();
        handle.send_auth_token(token.clone()).await.unwrap();

        match node.recv().await.control {
            Some(ControlMessage::AuthToken { token: received }) => assert_eq!(received, token),
            other => panic!("expected AuthToken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_without_token_rejected() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);

        let msg_id = node
            .send(ControlMessage::Register {
                node_id: "n1".to_string(),
                token: None,
            })
            .await;
        node.expect_ack(&msg_id).await;
        match node.recv().await.control {
            Some(ControlMessage::RegisterError { code, .. }) => {
                assert_eq!(code, RegisterErrorCode::MissingToken);
            }
            other => panic!("expected RegisterError, got {other:?}"),
        }
        node.expect_closed().await;
    }

    #[tokio::test]
    async fn register_with_unknown_token_rejected() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);

        let msg_id = node
            .send(ControlMessage::Register {
                node_id: "n1".to_string(),
                token: Some("deadbeef".to_string()),
            })
            .await;
        node.expect_ack(&msg_id).await;
        match node.recv().await.control {
            Some(ControlMessage::RegisterError { code, .. }) => {
                assert_eq!(code, RegisterErrorCode::InvalidToken);
            }
            other => panic!("expected RegisterError, got {other:?}"),
        }
        node.expect_closed().await;
    }

    #[tokio::test]
    async fn register_revoked_node_rejected() {
        let harness = harness();
        harness.ctx.db.insert_user("u1", "alice@example.com").unwrap();
        let token = harness.ctx.db.authorize_node("n1", "u1").unwrap();
        harness.ctx.db.revoke_node_owner("n1").unwrap();

        let (mut node, _task) = spawn_conn(&harness);
        let msg_id = node
            .send(ControlMessage::Register {
                node_id: "n1".to_string(),
                token: Some(token),
            })
            .await;
        node.expect_ack(&msg_id).await;
        match node.recv().await.control {
            Some(ControlMessage::RegisterError { code, .. }) => {
                assert_eq!(code, RegisterErrorCode::Unauthorized);
            }
            other => panic!("expected RegisterError, got {other:?}"),
        }
        node.expect_closed().await;
    }

    #[tokio::test]
    async fn register_then_announce() {
        let mut harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let msg_id = node
            .send(ControlMessage::Announce {
                services: vec![descriptor("s1", "n1")],
            })
            .await;
        node.expect_ack(&msg_id).await;

        // Wait for the announce to land in the registry.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if harness.ctx.services.get("s1").await.is_some() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(harness.ctx.services.get("s1").await.unwrap().node_id, "n1");
        assert_eq!(harness.ctx.db.services_for_node("n1").unwrap().len(), 1);
        match harness.stream_rx.recv().await {
            Some(StreamEvent::ServiceAnnounced(s)) => assert_eq!(s.descriptor.id, "s1"),
            other => panic!("expected ServiceAnnounced, got {other:?}"),
        }

        let row = harness.ctx.db.node_by_id("n1").unwrap().unwrap();
        assert!(row.last_connected_at.is_some());
    }

    #[tokio::test]
    async fn announce_for_foreign_node_has_no_effect() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let msg_id = node
            .send(ControlMessage::Announce {
                services: vec![descriptor("s1", "other-node")],
            })
            .await;
        node.expect_ack(&msg_id).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(harness.ctx.services.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn announce_before_register_closes_connection() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);

        let msg_id = node
            .send(ControlMessage::Announce {
                services: vec![descriptor("s1", "n1")],
            })
            .await;
        node.expect_ack(&msg_id).await;
        node.expect_closed().await;
        assert!(harness.ctx.services.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn bridge_data_reaches_sink() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let handle = harness.ctx.nodes.get_registered("n1").await.unwrap();
        let bridge_id = handle.open_bridge(descriptor("s1", "n1")).await.unwrap();

        // Node receives OPEN_BRIDGE and acks it
        let envelope = node.recv().await;
        match &envelope.control {
            Some(ControlMessage::OpenBridge {
                bridge_id: received,
                ..
            }) => assert_eq!(received, &bridge_id),
            other => panic!("expected OpenBridge, got {other:?}"),
        }
        node.send(ControlMessage::Ack {
            ack_msg_id: envelope.msg_id,
        })
        .await;

        let mut sink = handle.register_bridge_sink(&bridge_id).await.unwrap();
        node.send_data(&bridge_id, b"HELLO").await;

        let payload = tokio::time::timeout(std::time::Duration::from_secs(1), sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"HELLO");
    }

    #[tokio::test]
    async fn data_for_unknown_bridge_is_dropped() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let handle = harness.ctx.nodes.get_registered("n1").await.unwrap();
        let bridge_id = handle.open_bridge(descriptor("s1", "n1")).await.unwrap();
        node.recv().await; // open_bridge
        let mut sink = handle.register_bridge_sink(&bridge_id).await.unwrap();

        node.send_data("no-such-bridge", b"stray").await;
        node.send_data(&bridge_id, b"real").await;

        // Only the addressed payload arrives; the stray one was dropped and
        // the connection survived it.
        let payload = sink.recv().await.unwrap();
        assert_eq!(&payload[..], b"real");
    }

    #[tokio::test]
    async fn relay_data_reaches_node() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let handle = harness.ctx.nodes.get_registered("n1").await.unwrap();
        let bridge_id = handle.open_bridge(descriptor("s1", "n1")).await.unwrap();
        node.recv().await; // open_bridge

        handle
            .send_data(&bridge_id, Bytes::from_static(b"DOWN"))
            .await
            .unwrap();
        let envelope = node.recv().await;
        let data = envelope.data.expect("data envelope");
        assert_eq!(data.bridge_id, bridge_id);
        assert_eq!(&data.payload[..], b"DOWN");
    }

    #[tokio::test]
    async fn disconnect_cleans_up_everything() {
        let mut harness = harness();
        let (mut node, task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let msg_id = node
            .send(ControlMessage::Announce {
                services: vec![descriptor("s1", "n1")],
            })
            .await;
        node.expect_ack(&msg_id).await;

        // Drop the node side entirely
        drop(node);
        task.await.unwrap();

        assert!(harness.ctx.services.get("s1").await.is_none());
        assert!(harness.ctx.nodes.get("n1").await.is_none());

        // Announce event, then the disconnect
        let mut saw_disconnect = false;
        while let Ok(event) = harness.stream_rx.try_recv() {
            if matches!(event, StreamEvent::NodeDisconnected(ref id) if id == "n1") {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn close_bridge_from_node_removes_entry() {
        let harness = harness();
        let (mut node, _task) = spawn_conn(&harness);
        register(&harness, &mut node, "n1").await;

        let handle = harness.ctx.nodes.get_registered("n1").await.unwrap();
        let bridge_id = handle.open_bridge(descriptor("s1", "n1")).await.unwrap();
        node.recv().await; // open_bridge
        assert!(handle.has_bridge(&bridge_id).await);

        let msg_id = node
            .send(ControlMessage::CloseBridge {
                bridge_id: bridge_id.clone(),
            })
            .await;
        node.expect_ack(&msg_id).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while handle.has_bridge(&bridge_id).await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
