//! MJPEG cameras via an external transcoder.
//!
//! The bridge is exposed as a local TCP proxy; ffmpeg reads the camera's
//! MJPEG over HTTP from that proxy and writes H.264 Annex B to stdout,
//! which becomes the source's single video track.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use unblink_protocol::ServiceDescriptor;

use crate::media::h264::AnnexBSplitter;
use crate::media::{
    H264_TEE_CAPACITY, MediaReceiver, TRACK_QUEUE_CAPACITY, TrackCodec, TrackPacket,
};
use crate::node_conn::NodeHandle;
use crate::proxy::BridgeTcpProxy;

/// H.264 parameters the transcoder is configured to produce.
const TRANSCODER_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

pub struct MjpegSource {
    proxy: Option<BridgeTcpProxy>,
    transcoder: Child,
    receivers: Vec<MediaReceiver>,
    packets: mpsc::Sender<TrackPacket>,
    h264_tee: broadcast::Sender<Bytes>,
    bridge_id: String,
}

impl MjpegSource {
    pub async fn connect(node: Arc<NodeHandle>, service: &ServiceDescriptor) -> Result<Self> {
        let bridge_id = node.open_bridge(service.clone()).await?;
        match Self::start(Arc::clone(&node), bridge_id.clone(), service).await {
            Ok(source) => Ok(source),
            Err(e) => {
                node.close_bridge(&bridge_id).await;
                Err(e)
            }
        }
    }

    async fn start(
        node: Arc<NodeHandle>,
        bridge_id: String,
        service: &ServiceDescriptor,
    ) -> Result<Self> {
        let proxy = BridgeTcpProxy::bind(node, bridge_id.clone()).await?;
        let path = if service.path.is_empty() {
            "/"
        } else {
            &service.path
        };
        let input_url = format!("http://{}{}", proxy.addr, path);

        // Low latency, forced keyframes about once a second so late joiners
        // and the frame extractor get decodable output quickly.
        let transcoder = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "mjpeg",
                "-i",
                &input_url,
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-force_key_frames",
                "expr:gte(t,n_forced*1)",
                "-pix_fmt",
                "yuv420p",
                "-f",
                "h264",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn transcoder (is ffmpeg installed?)")?;

        let (packets, rx) = mpsc::channel(TRACK_QUEUE_CAPACITY);
        let (h264_tee, _) = broadcast::channel(H264_TEE_CAPACITY);
        let codec = TrackCodec::H264 {
            clock_rate: 90_000,
            fmtp: TRANSCODER_FMTP.to_string(),
        };

        tracing::info!(%bridge_id, %input_url, "MJPEG transcoder started");
        Ok(Self {
            proxy: Some(proxy),
            transcoder,
            receivers: vec![MediaReceiver {
                codec,
                flavor: crate::media::PacketFlavor::AccessUnit,
                packets: rx,
            }],
            packets,
            h264_tee,
            bridge_id,
        })
    }

    pub fn take_receivers(&mut self) -> Vec<MediaReceiver> {
        std::mem::take(&mut self.receivers)
    }

    pub fn subscribe_h264(&self) -> broadcast::Receiver<Bytes> {
        self.h264_tee.subscribe()
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// Pump transcoder output into the track and the extraction tee.
    pub async fn run_producer(&mut self) -> Result<()> {
        let mut stdout = self
            .transcoder
            .stdout
            .take()
            .ok_or_else(|| anyhow!("transcoder stdout already taken"))?;
        let mut splitter = AnnexBSplitter::new();
        let mut chunk = vec![0u8; 32 * 1024];

        loop {
            let n = stdout
                .read(&mut chunk)
                .await
                .context("transcoder read failed")?;
            if n == 0 {
                let status = self.transcoder.wait().await?;
                anyhow::bail!("transcoder exited: {status}");
            }
            for unit in splitter.push(&chunk[..n]) {
                let _ = self.h264_tee.send(unit.clone());
                if self
                    .packets
                    .try_send(TrackPacket::AccessUnit(unit))
                    .is_err()
                {
                    tracing::trace!(bridge_id = %self.bridge_id, "Receiver queue full, access unit dropped");
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.transcoder.kill().await {
            tracing::debug!(bridge_id = %self.bridge_id, "Transcoder kill failed: {e}");
        }
        if let Some(proxy) = self.proxy.take() {
            proxy.close().await;
        }
    }
}
