//! Long-lived realtime streams, one per announced camera service.
//!
//! When auto-realtime is enabled, every announced camera gets a standing
//! bridge + media source + frame extractor, so the CV bus sees frames even
//! with no browser watching. Streams die with their service or node.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::cv::CvEventBus;
use crate::extractor::FrameExtractor;
use crate::media::MediaSource;
use crate::node_conn::NodeTable;
use crate::registry::RegisteredService;
use crate::session::SessionManager;
use crate::storage::StorageManager;

/// Lifecycle notifications from node connections and the service API.
#[derive(Debug)]
pub enum StreamEvent {
    ServiceAnnounced(RegisteredService),
    ServiceRemoved(String),
    NodeDisconnected(String),
}

struct RealtimeStream {
    node_id: String,
    producer_stop: oneshot::Sender<()>,
    extractor: FrameExtractor,
}

/// Owns the realtime streams and reacts to lifecycle events.
pub struct RealtimeStreamManager {
    nodes: Arc<NodeTable>,
    sessions: Arc<SessionManager>,
    storage: Arc<StorageManager>,
    bus: Arc<CvEventBus>,
    frame_interval_seconds: u64,
    batch_size: usize,
    auto_realtime: bool,
    streams: RwLock<HashMap<String, RealtimeStream>>,
}

impl RealtimeStreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nodes: Arc<NodeTable>,
        sessions: Arc<SessionManager>,
        storage: Arc<StorageManager>,
        bus: Arc<CvEventBus>,
        frame_interval_seconds: u64,
        batch_size: usize,
        auto_realtime: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes,
            sessions,
            storage,
            bus,
            frame_interval_seconds,
            batch_size,
            auto_realtime,
            streams: RwLock::new(HashMap::new()),
        })
    }

    /// Consume lifecycle events until the sender side is dropped.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::ServiceAnnounced(service) => {
                        self.on_service_announced(service).await;
                    }
                    StreamEvent::ServiceRemoved(service_id) => {
                        self.on_service_removed(&service_id).await;
                    }
                    StreamEvent::NodeDisconnected(node_id) => {
                        self.on_node_disconnected(&node_id).await;
                    }
                }
            }
        })
    }

    async fn on_service_announced(self: &Arc<Self>, service: RegisteredService) {
        if !self.auto_realtime {
            return;
        }
        let service_id = service.descriptor.id.clone();
        if self.streams.read().await.contains_key(&service_id) {
            // Re-announce of a live stream; keep the existing one
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.start_stream(service).await {
                tracing::warn!(%service_id, "Failed to start realtime stream: {e:#}");
            }
        });
    }

    async fn start_stream(self: &Arc<Self>, service: RegisteredService) -> anyhow::Result<()> {
        let service_id = service.descriptor.id.clone();
        let node = self
            .nodes
            .get_registered(&service.node_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("node {} not connected", service.node_id))?;

        let mut source = MediaSource::connect(node, &service.descriptor).await?;
        let h264 = source.subscribe_h264();
        // The realtime stream has no browser; receivers stay unconsumed and
        // the producer feeds the extraction tee.
        drop(source.take_receivers());

        let extractor = FrameExtractor::spawn(
            service_id.clone(),
            self.frame_interval_seconds,
            self.batch_size,
            h264,
            Arc::clone(&self.storage),
            Arc::clone(&self.bus),
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let producer_service_id = service_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = source.run_producer() => {
                    if let Err(e) = result {
                        tracing::debug!(service_id = %producer_service_id, "Realtime producer ended: {e:#}");
                    }
                }
                _ = stop_rx => {}
            }
            source.close().await;
        });

        let mut streams = self.streams.write().await;
        if streams.contains_key(&service_id) {
            // Lost the race against a concurrent announce; ours is redundant
            let _ = stop_tx.send(());
            drop(streams);
            extractor.stop();
            return Ok(());
        }
        streams.insert(
            service_id.clone(),
            RealtimeStream {
                node_id: service.node_id.clone(),
                producer_stop: stop_tx,
                extractor,
            },
        );
        tracing::info!(%service_id, node_id = %service.node_id, "Realtime stream started");
        Ok(())
    }

    async fn on_service_removed(&self, service_id: &str) {
        if let Some(stream) = self.streams.write().await.remove(service_id) {
            stop_stream(service_id, stream);
        }
        self.sessions.destroy_for_service(service_id).await;
    }

    async fn on_node_disconnected(&self, node_id: &str) {
        let mut streams = self.streams.write().await;
        let doomed: Vec<String> = streams
            .iter()
            .filter(|(_, s)| s.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for service_id in doomed {
            if let Some(stream) = streams.remove(&service_id) {
                stop_stream(&service_id, stream);
            }
        }
        drop(streams);
        self.sessions.destroy_for_node(node_id).await;
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn shutdown(&self) {
        let mut streams = self.streams.write().await;
        for (service_id, stream) in streams.drain() {
            stop_stream(&service_id, stream);
        }
    }
}

fn stop_stream(service_id: &str, stream: RealtimeStream) {
    let _ = stream.producer_stop.send(());
    stream.extractor.stop();
    tracing::info!(%service_id, "Realtime stream stopped");
}
