//! CV worker registry and event bus.
//!
//! Workers connect over their own WebSocket, register to receive a key,
//! then get a fan-out of frame / frame_batch events. Anything they publish
//! back (over the socket or `POST /events`) is persisted and fanned out to
//! dashboard subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::auth;
use crate::broadcast::{EventBroadcaster, StoredEvent};
use crate::db::Db;
use crate::registry::ServiceRegistry;

/// Outbound queue depth per worker. The bus is best-effort: a worker that
/// cannot drain its queue loses events rather than stalling emission.
pub const WORKER_QUEUE_CAPACITY: usize = 64;

/// One extracted frame, as emitted on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub frame_uuid: String,
    pub service_id: String,
    pub timestamp: String,
    pub sequence: u64,
}

/// Event ingestion failures a worker can be told about.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("event payload must be a JSON object")]
    NotAnObject,
    #[error("event payload must carry a service_id")]
    MissingServiceId,
    #[error("failed to store event")]
    Storage(#[from] anyhow::Error),
}

/// A stored event acknowledgment.
#[derive(Debug, Clone, Serialize)]
pub struct IngestedEvent {
    pub id: String,
    pub created_at: String,
}

struct WorkerHandle {
    key: String,
    outbox: mpsc::Sender<String>,
}

/// Connected workers keyed by worker id. A worker's key lives exactly as
/// long as its socket; disconnect invalidates it.
pub struct CvWorkerRegistry {
    workers: RwLock<HashMap<String, WorkerHandle>>,
}

impl CvWorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Mint an identity + key for a newly registered worker.
    pub async fn register(&self) -> (String, String, mpsc::Receiver<String>) {
        let worker_id = Uuid::new_v4().to_string();
        let key = auth::generate_token();
        let (outbox, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        self.workers.write().await.insert(
            worker_id.clone(),
            WorkerHandle {
                key: key.clone(),
                outbox,
            },
        );
        tracing::info!(%worker_id, "Worker registered");
        (worker_id, key, rx)
    }

    /// Remove a worker and invalidate its key.
    pub async fn remove(&self, worker_id: &str) {
        if self.workers.write().await.remove(worker_id).is_some() {
            tracing::info!(%worker_id, "Worker removed, key invalidated");
        }
    }

    /// Resolve a presented key to a live worker id.
    pub async fn authenticate(&self, key: &str) -> Option<String> {
        let workers = self.workers.read().await;
        for (worker_id, handle) in workers.iter() {
            if auth::constant_time_eq(handle.key.as_bytes(), key.as_bytes()) {
                return Some(worker_id.clone());
            }
        }
        None
    }

    /// Fan one serialized envelope out to every connected worker.
    async fn emit(&self, envelope: String) {
        let workers = self.workers.read().await;
        for (worker_id, handle) in workers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                handle.outbox.try_send(envelope.clone())
            {
                tracing::warn!(%worker_id, "Worker queue full, event dropped");
            }
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

/// The CV event bus: emits frame events to workers and ingests the events
/// they publish back.
pub struct CvEventBus {
    pub registry: CvWorkerRegistry,
    db: Arc<Db>,
    services: Arc<ServiceRegistry>,
    broadcaster: Arc<EventBroadcaster>,
}

impl CvEventBus {
    pub fn new(
        db: Arc<Db>,
        services: Arc<ServiceRegistry>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            registry: CvWorkerRegistry::new(),
            db,
            services,
            broadcaster,
        }
    }

    fn envelope(kind: &str, data: serde_json::Value) -> String {
        json!({
            "type": kind,
            "id": Uuid::new_v4().to_string(),
            "created_at": Utc::now().to_rfc3339(),
            "data": data,
        })
        .to_string()
    }

    /// Emit a single-frame event to all workers.
    pub async fn emit_frame(&self, frame: &FrameRecord) {
        let envelope = Self::envelope(
            "frame",
            serde_json::to_value(frame).unwrap_or_default(),
        );
        self.registry.emit(envelope).await;
    }

    /// Emit a batched-frames event to all workers.
    pub async fn emit_frame_batch(
        &self,
        service_id: &str,
        frame_uuids: &[String],
        duration_seconds: u64,
    ) {
        let envelope = Self::envelope(
            "frame_batch",
            json!({
                "service_id": service_id,
                "frame_uuids": frame_uuids,
                "metadata": { "duration_seconds": duration_seconds },
            }),
        );
        self.registry.emit(envelope).await;
    }

    /// Ingest a worker-published event: derive granularity when the payload
    /// carries a time span, persist it, and fan it out to subscribers.
    pub async fn ingest_event(
        &self,
        mut payload: serde_json::Value,
    ) -> Result<IngestedEvent, IngestError> {
        if !payload.is_object() {
            return Err(IngestError::NotAnObject);
        }
        let service_id = payload
            .get("service_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or(IngestError::MissingServiceId)?;

        unblink_protocol::attach_granularity(&mut payload);

        let id = Uuid::new_v4().to_string();
        let created_at = self.db.insert_event(&id, &service_id, &payload)?;

        // Live registry first; fall back to the persisted row for events
        // about a camera whose node is currently offline.
        let node_id = match self.services.get(&service_id).await {
            Some(service) => service.node_id,
            None => self
                .db
                .service_by_id(&service_id)?
                .map(|s| s.node_id)
                .unwrap_or_default(),
        };

        self.broadcaster
            .publish(StoredEvent {
                id: id.clone(),
                node_id,
                service_id,
                payload,
                created_at: created_at.clone(),
            })
            .await;

        Ok(IngestedEvent { id, created_at })
    }
}

/// Drive one worker WebSocket: register → fan-out + ingest → invalidate.
pub async fn handle_worker_socket(mut socket: WebSocket, bus: Arc<CvEventBus>) {
    // The first message must be a registration.
    let registered = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let parsed: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("Worker sent invalid JSON before registering: {e}");
                        break false;
                    }
                };
                if parsed.get("type").and_then(|t| t.as_str()) == Some("register") {
                    break true;
                }
                tracing::warn!("Worker sent non-register message first");
                break false;
            }
            Some(Ok(Message::Close(_))) | None => break false,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("Worker socket error before registration: {e}");
                break false;
            }
        }
    };
    if !registered {
        let error = json!({
            "type": "register_error",
            "data": { "code": "registration_required", "message": "send {\"type\":\"register\"} first" },
        });
        let _ = socket.send(Message::Text(error.to_string().into())).await;
        return;
    }

    let (worker_id, key, mut outbox) = bus.registry.register().await;
    let welcome = json!({
        "type": "registered",
        "data": { "worker_id": worker_id, "key": key },
    });
    if socket
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        bus.registry.remove(&worker_id).await;
        return;
    }

    loop {
        tokio::select! {
            envelope = outbox.recv() => {
                let Some(envelope) = envelope else { break };
                if socket.send(Message::Text(envelope.into())).await.is_err() {
                    tracing::debug!(%worker_id, "Worker socket send failed");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_worker_message(&bus, &worker_id, &mut socket, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%worker_id, "Worker socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    bus.registry.remove(&worker_id).await;
    tracing::info!(%worker_id, "Worker disconnected");
}

async fn handle_worker_message(
    bus: &CvEventBus,
    worker_id: &str,
    socket: &mut WebSocket,
    text: &str,
) {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%worker_id, "Worker sent invalid JSON: {e}");
            return;
        }
    };
    match parsed.get("type").and_then(|t| t.as_str()) {
        Some("event") => {
            let payload = parsed.get("data").cloned().unwrap_or(serde_json::Value::Null);
            match bus.ingest_event(payload).await {
                Ok(stored) => {
                    let ack = json!({ "type": "event_stored", "data": stored });
                    let _ = socket.send(Message::Text(ack.to_string().into())).await;
                }
                Err(e) => {
                    tracing::warn!(%worker_id, "Event rejected: {e}");
                    let error = json!({
                        "type": "error",
                        "data": { "code": "invalid_event", "message": e.to_string() },
                    });
                    let _ = socket.send(Message::Text(error.to_string().into())).await;
                }
            }
        }
        Some("register") => {
            tracing::debug!(%worker_id, "Duplicate register ignored");
        }
        other => {
            tracing::debug!(%worker_id, ?other, "Unknown worker message type");
        }
    }
}
