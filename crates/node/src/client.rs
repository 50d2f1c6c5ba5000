//! The relay client: one WebSocket, the authorization/registration flow,
//! service announcement, and bridge dispatch.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use unblink_protocol::{
    ControlMessage, Envelope, NodeConfig, RegisterErrorCode, ServiceDescriptor,
};
use uuid::Uuid;

use crate::bridge::{BridgeNotice, BridgeSet};
use crate::token;

/// Outbound envelope queue shared by all bridge pumps.
const OUTBOX_CAPACITY: usize = 256;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// The node's stable identity: configured, previously persisted, or
/// freshly generated and persisted.
pub fn resolve_node_id(config: &NodeConfig) -> Result<String> {
    if let Some(node_id) = &config.node_id {
        return Ok(node_id.clone());
    }
    let path = config.node_id_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    let node_id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, &node_id)
        .with_context(|| format!("Failed to persist node id to {}", path.display()))?;
    info!(%node_id, "Generated node id");
    Ok(node_id)
}

/// Load the services this node announces, claiming them for `node_id`.
pub fn load_services(path: &Path, node_id: &str) -> Result<Vec<ServiceDescriptor>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "No service list at {}; announcing nothing",
                path.display()
            );
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let mut services: Vec<ServiceDescriptor> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    // The relay only accepts services claimed by the announcing node.
    for service in &mut services {
        service.node_id = node_id.to_string();
    }
    Ok(services)
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Run the client until reconnection is exhausted or disabled.
pub async fn run(config: &NodeConfig, node_id: &str, services: &[ServiceDescriptor]) -> Result<()> {
    let max_backoff = Duration::from_secs(config.reconnect_max_seconds.max(1));
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts: u32 = 0;

    loop {
        info!(url = %config.relay_url, "Connecting to relay");
        let mut registered = false;

        let result = connect_and_serve(config, node_id, services, &mut registered).await;
        if registered {
            // A successful registration resets the failure budget
            backoff = INITIAL_BACKOFF;
            attempts = 0;
        }
        match &result {
            Ok(()) => info!("Relay connection closed"),
            Err(e) => warn!("Relay connection failed: {e:#}"),
        }

        if !config.reconnect {
            return result;
        }
        attempts += 1;
        if config.reconnect_max_attempts > 0 && attempts >= config.reconnect_max_attempts {
            anyhow::bail!(
                "giving up after {attempts} consecutive connection failures"
            );
        }
        info!("Reconnecting in {} seconds...", backoff.as_secs());
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, max_backoff);
    }
}

async fn connect_and_serve(
    config: &NodeConfig,
    node_id: &str,
    services: &[ServiceDescriptor],
    registered: &mut bool,
) -> Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(&config.relay_url)
        .await
        .context("WebSocket connection failed")?;
    info!("Connected to relay");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Envelope>(OUTBOX_CAPACITY);
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let mut bridges = BridgeSet::new(outbox_tx, notice_tx);

    let token_path = config.token_path();
    let opening = match token::load(&token_path) {
        Some(stored) => Envelope::control(ControlMessage::Register {
            node_id: node_id.to_string(),
            token: Some(stored),
        }),
        None => {
            info!("No persisted token; requesting authorization");
            Envelope::control(ControlMessage::ReqAuthorizationUrl {
                node_id: node_id.to_string(),
            })
        }
    };
    send_envelope(&mut ws_tx, &opening).await?;

    let result = loop {
        tokio::select! {
            Some(envelope) = outbox_rx.recv() => {
                if let Err(e) = send_envelope(&mut ws_tx, &envelope).await {
                    break Err(e);
                }
            }
            Some(notice) = notice_rx.recv() => {
                let BridgeNotice::Closed(bridge_id) = notice;
                bridges.close(&bridge_id);
                let close = Envelope::control(ControlMessage::CloseBridge { bridge_id });
                if let Err(e) = send_envelope(&mut ws_tx, &close).await {
                    break Err(e);
                }
            }
            incoming = ws_rx.next() => {
                let envelope = match incoming {
                    Some(Ok(Message::Binary(bytes))) => match Envelope::decode(&bytes) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("Dropping undecodable envelope: {e}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.into()),
                };
                let replies = handle_envelope(
                    envelope,
                    config,
                    node_id,
                    services,
                    &mut bridges,
                    registered,
                )
                .await;
                let mut failed = None;
                for reply in replies {
                    if let Err(e) = send_envelope(&mut ws_tx, &reply).await {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    break Err(e);
                }
            }
        }
    };

    // No bridge survives this connection
    if bridges.len() > 0 {
        debug!(bridges = bridges.len(), "Dropping bridges with the connection");
    }
    bridges.close_all();
    result
}

async fn send_envelope<S>(ws_tx: &mut S, envelope: &Envelope) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let bytes = envelope.encode()?;
    ws_tx
        .send(Message::Binary(bytes.into()))
        .await
        .context("WebSocket send failed")?;
    Ok(())
}

/// Process one envelope from the relay, returning replies in order (the
/// ACK for a control message always first).
async fn handle_envelope(
    envelope: Envelope,
    config: &NodeConfig,
    node_id: &str,
    services: &[ServiceDescriptor],
    bridges: &mut BridgeSet,
    registered: &mut bool,
) -> Vec<Envelope> {
    if let Some(data) = envelope.data {
        bridges.deliver(&data.bridge_id, data.payload);
        return Vec::new();
    }
    let Some(control) = envelope.control else {
        return Vec::new();
    };

    if let ControlMessage::Ack { ack_msg_id } = &control {
        trace!(%ack_msg_id, "ACK from relay");
        return Vec::new();
    }

    let mut replies = vec![Envelope::ack(&envelope.msg_id)];
    match control {
        ControlMessage::ResAuthorizationUrl { auth_url } => {
            info!("===========================================");
            info!("  Authorize this node in your dashboard:");
            info!("  {auth_url}");
            info!("===========================================");
        }
        ControlMessage::AuthToken { token: new_token } => {
            info!("Received authorization token");
            if let Err(e) = token::store(&config.token_path(), &new_token) {
                error!("Failed to persist token: {e:#}");
            }
            replies.push(Envelope::control(ControlMessage::Register {
                node_id: node_id.to_string(),
                token: Some(new_token),
            }));
        }
        ControlMessage::RegisterError { code, message } => {
            error!(?code, %message, "Registration rejected");
            if code == RegisterErrorCode::InvalidToken {
                // A stale token never becomes valid again; forget it so the
                // next connection re-runs authorization.
                token::clear(&config.token_path());
            }
        }
        ControlMessage::ConnectionReady {
            node_id: ready_id, ..
        } => {
            info!(node_id = %ready_id, "Registered with relay");
            *registered = true;
            replies.push(Envelope::control(ControlMessage::Announce {
                services: services.to_vec(),
            }));
            info!(count = services.len(), "Services announced");
        }
        ControlMessage::OpenBridge { bridge_id, service } => {
            match bridges.open(bridge_id.clone(), &service).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(%bridge_id, "Failed to open bridge: {e:#}");
                    replies.push(Envelope::control(ControlMessage::CloseBridge {
                        bridge_id,
                    }));
                }
            }
        }
        ControlMessage::CloseBridge { bridge_id } => {
            bridges.close(&bridge_id);
        }
        other => {
            debug!(message = ?std::mem::discriminant(&other), "Unexpected message from relay");
        }
    }
    replies
}
