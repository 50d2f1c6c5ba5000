//! WebRTC sessions: one peer connection per client offer, fed by a media
//! source over a bridge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{RwLock, oneshot};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::util::Unmarshal;

use crate::media::{MediaReceiver, MediaSource, PacketFlavor, TrackCodec, TrackPacket};
use crate::node_conn::NodeHandle;
use crate::registry::RegisteredService;

/// Overall offer→answer deadline, media setup included.
const NEGOTIATE_DEADLINE: Duration = Duration::from_secs(15);

/// Nominal sample duration for transcoded H.264 access units.
const SAMPLE_DURATION: Duration = Duration::from_millis(33);

/// Everything a session owns. Destroying it closes the peer connection,
/// stops the producer, and closes the bridge.
pub struct WebRtcSession {
    pub session_id: Uuid,
    pub bridge_id: String,
    pub node_id: String,
    pub service_id: String,
    peer: Arc<RTCPeerConnection>,
    producer_stop: Option<oneshot::Sender<()>>,
    writer_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Session bookkeeping info for the API surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub bridge_id: String,
    pub node_id: String,
    pub service_id: String,
}

/// Creates, tracks, and tears down WebRTC sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, WebRtcSession>>,
    stun_urls: Vec<String>,
}

impl SessionManager {
    pub fn new(stun_urls: Vec<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            stun_urls,
        }
    }

    /// Negotiate a session for a client offer and return the SDP answer.
    ///
    /// Opens a bridge to the camera, drives the media source, attaches its
    /// video to the peer connection, and answers after ICE gathering. Every
    /// failure path releases the bridge.
    pub async fn create_session(
        self: &Arc<Self>,
        node: Arc<NodeHandle>,
        service: &RegisteredService,
        offer_sdp: String,
    ) -> Result<(Uuid, String)> {
        tokio::time::timeout(
            NEGOTIATE_DEADLINE,
            self.negotiate(node, service, offer_sdp),
        )
        .await
        .map_err(|_| anyhow!("session negotiation timed out"))?
    }

    async fn negotiate(
        self: &Arc<Self>,
        node: Arc<NodeHandle>,
        service: &RegisteredService,
        offer_sdp: String,
    ) -> Result<(Uuid, String)> {
        let session_id = Uuid::new_v4();
        let mut source = MediaSource::connect(node, &service.descriptor)
            .await
            .context("media source setup failed")?;
        let bridge_id = source.bridge_id().to_string();

        match self
            .negotiate_peer(session_id, &mut source, &offer_sdp)
            .await
        {
            Ok((peer, writer_tasks, answer)) => {
                let (stop_tx, stop_rx) = oneshot::channel();
                tokio::spawn(run_producer(source, stop_rx));

                let session = WebRtcSession {
                    session_id,
                    bridge_id,
                    node_id: service.node_id.clone(),
                    service_id: service.descriptor.id.clone(),
                    peer,
                    producer_stop: Some(stop_tx),
                    writer_tasks,
                };
                self.watch_connection_state(&session);
                self.sessions.write().await.insert(session_id, session);
                tracing::info!(
                    %session_id,
                    service_id = %service.descriptor.id,
                    "WebRTC session established"
                );
                Ok((session_id, answer))
            }
            Err(e) => {
                source.close().await;
                Err(e)
            }
        }
    }

    async fn negotiate_peer(
        &self,
        session_id: Uuid,
        source: &mut MediaSource,
        offer_sdp: &str,
    ) -> Result<(
        Arc<RTCPeerConnection>,
        Vec<tokio::task::JoinHandle<()>>,
        String,
    )> {
        let receivers = source.take_receivers();
        let video = receivers
            .into_iter()
            .find(|r| r.codec.is_h264())
            .ok_or_else(|| anyhow!("source yielded no H.264 receiver"))?;
        let fmtp = match &video.codec {
            TrackCodec::H264 { fmtp, .. } if !fmtp.is_empty() => fmtp.clone(),
            _ => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
        };

        // Register ONLY H.264. Leaving the default codec set in place lets
        // browsers negotiate VP8 against a track we cannot feed.
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.clone(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);

        if count_video_mlines(offer_sdp) == 0 {
            peer.close().await.ok();
            anyhow::bail!("offer contains no video media");
        }

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())?;
        peer.set_remote_description(offer).await?;

        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90_000,
            sdp_fmtp_line: fmtp,
            ..Default::default()
        };
        let writer = spawn_track_writer(session_id, &peer, capability, video).await?;

        let answer = peer.create_answer(None).await?;
        let mut gather_complete = peer.gathering_complete_promise().await;
        peer.set_local_description(answer).await?;
        // Complete SDP only after ICE gathering so the client gets every
        // candidate in the answer.
        let _ = gather_complete.recv().await;
        let local = peer
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after gathering"))?;

        Ok((peer, vec![writer], local.sdp))
    }

    /// Tear the whole session down when ICE gives up on the client.
    fn watch_connection_state(self: &Arc<Self>, session: &WebRtcSession) {
        let manager = Arc::clone(self);
        let session_id = session.session_id;
        session
            .peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!(%session_id, ?state, "Peer connection state changed");
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                    ) {
                        manager.destroy_session(session_id).await;
                    }
                })
            }));
    }

    /// Destroy one session; idempotent.
    pub async fn destroy_session(&self, session_id: Uuid) {
        let Some(mut session) = self.sessions.write().await.remove(&session_id) else {
            return;
        };
        if let Some(stop) = session.producer_stop.take() {
            let _ = stop.send(());
        }
        for task in &session.writer_tasks {
            task.abort();
        }
        if let Err(e) = session.peer.close().await {
            tracing::debug!(%session_id, "Peer close failed: {e}");
        }
        tracing::info!(%session_id, "WebRTC session destroyed");
    }

    /// Destroy every session bound to a node (node disconnect).
    pub async fn destroy_for_node(&self, node_id: &str) {
        let doomed: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.session_id)
            .collect();
        for session_id in doomed {
            self.destroy_session(session_id).await;
        }
    }

    /// Destroy every session for one service (service removed).
    pub async fn destroy_for_service(&self, service_id: &str) {
        let doomed: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.service_id == service_id)
            .map(|s| s.session_id)
            .collect();
        for session_id in doomed {
            self.destroy_session(session_id).await;
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionInfo {
                session_id: s.session_id,
                bridge_id: s.bridge_id.clone(),
                node_id: s.node_id.clone(),
                service_id: s.service_id.clone(),
            })
            .collect()
    }

    /// Destroy everything (shutdown).
    pub async fn shutdown(&self) {
        let doomed: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        for session_id in doomed {
            self.destroy_session(session_id).await;
        }
    }
}

/// Drive the media source until it ends or the session stops it, then
/// release the bridge.
async fn run_producer(mut source: MediaSource, stop: oneshot::Receiver<()>) {
    tokio::select! {
        result = source.run_producer() => {
            if let Err(e) = result {
                tracing::debug!("Producer ended: {e:#}");
            }
        }
        _ = stop => {}
    }
    source.close().await;
}

/// Attach the receiver's video to the peer connection and pump packets.
async fn spawn_track_writer(
    session_id: Uuid,
    peer: &Arc<RTCPeerConnection>,
    capability: RTCRtpCodecCapability,
    mut receiver: MediaReceiver,
) -> Result<tokio::task::JoinHandle<()>> {
    // RTSP receivers hand us RTP packets; transcoded sources hand us whole
    // access units. Pick the matching track flavor.
    enum Writer {
        Rtp(Arc<TrackLocalStaticRTP>),
        Sample(Arc<TrackLocalStaticSample>),
    }

    let writer = match receiver.flavor {
        PacketFlavor::Rtp => {
            let track = Arc::new(TrackLocalStaticRTP::new(
                capability,
                "video".to_string(),
                "unblink".to_string(),
            ));
            peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("Failed to add video track")?;
            Writer::Rtp(track)
        }
        PacketFlavor::AccessUnit => {
            let track = Arc::new(TrackLocalStaticSample::new(
                capability,
                "video".to_string(),
                "unblink".to_string(),
            ));
            peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("Failed to add video track")?;
            Writer::Sample(track)
        }
    };

    Ok(tokio::spawn(async move {
        while let Some(packet) = receiver.packets.recv().await {
            let result = match (&writer, packet) {
                (Writer::Rtp(track), TrackPacket::Rtp(bytes)) => {
                    let mut raw = &bytes[..];
                    match webrtc::rtp::packet::Packet::unmarshal(&mut raw) {
                        Ok(rtp) => track.write_rtp(&rtp).await.map(|_| ()),
                        Err(e) => {
                            tracing::trace!(%session_id, "Unparsable RTP packet: {e}");
                            continue;
                        }
                    }
                }
                (Writer::Sample(track), TrackPacket::AccessUnit(bytes)) => {
                    track
                        .write_sample(&Sample {
                            data: bytes,
                            duration: SAMPLE_DURATION,
                            ..Default::default()
                        })
                        .await
                        .map(|_| ())
                }
                // A source never mixes flavors on one receiver
                _ => continue,
            };
            if let Err(e) = result {
                tracing::debug!(%session_id, "Track write failed: {e}");
                break;
            }
        }
        tracing::debug!(%session_id, "Track writer finished");
    }))
}

/// Number of video m-lines in an SDP blob.
fn count_video_mlines(sdp: &str) -> usize {
    sdp.lines()
        .filter(|line| line.starts_with("m=video"))
        .count()
}
