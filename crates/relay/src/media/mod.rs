//! Media sources for camera services reached over bridges.
//!
//! A source is one of two transport variants with a common capability set:
//! a producer loop, a set of receivers, and close. RTSP speaks the protocol
//! directly over the bridge byte stream; MJPEG runs an external transcoder
//! against the bridge's local TCP proxy and consumes H.264 from it.

pub mod h264;
pub mod mjpeg;
pub mod rtsp;

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use unblink_protocol::{ServiceDescriptor, ServiceKind};

use crate::node_conn::NodeHandle;

/// Queue depth per receiver track. Video is loss-tolerant; a stalled
/// consumer loses packets instead of stalling the producer.
pub const TRACK_QUEUE_CAPACITY: usize = 256;

/// Fan-out capacity of the H.264 access-unit tee feeding frame extraction.
pub const H264_TEE_CAPACITY: usize = 64;

/// Codec of one receiver track.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackCodec {
    H264 { clock_rate: u32, fmtp: String },
    Other { name: String, clock_rate: u32 },
}

impl TrackCodec {
    pub fn is_h264(&self) -> bool {
        matches!(self, TrackCodec::H264 { .. })
    }
}

/// One media payload handed to a consumer.
#[derive(Debug, Clone)]
pub enum TrackPacket {
    /// A complete RTP packet as read off the wire
    Rtp(Bytes),
    /// An H.264 Annex B access unit
    AccessUnit(Bytes),
}

/// How a receiver delivers its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFlavor {
    /// RTP packets straight off the camera (RTSP sources)
    Rtp,
    /// Whole access units (transcoded sources)
    AccessUnit,
}

/// Receiver for one elementary stream of a source.
pub struct MediaReceiver {
    pub codec: TrackCodec,
    pub flavor: PacketFlavor,
    pub packets: mpsc::Receiver<TrackPacket>,
}

/// A connected media source for one camera service.
pub enum MediaSource {
    Rtsp(rtsp::RtspSource),
    Mjpeg(mjpeg::MjpegSource),
}

impl MediaSource {
    /// Open a bridge to the service and negotiate the media transport.
    ///
    /// A successful connect commits to at least one usable H.264 video
    /// receiver; on failure at any step the bridge is closed before the
    /// error is returned.
    pub async fn connect(node: Arc<NodeHandle>, service: &ServiceDescriptor) -> Result<Self> {
        match service.kind {
            ServiceKind::Rtsp => Ok(MediaSource::Rtsp(
                rtsp::RtspSource::connect(node, service).await?,
            )),
            ServiceKind::Mjpeg => Ok(MediaSource::Mjpeg(
                mjpeg::MjpegSource::connect(node, service).await?,
            )),
        }
    }

    /// Take the source's receivers. Empty after the first call.
    pub fn take_receivers(&mut self) -> Vec<MediaReceiver> {
        match self {
            MediaSource::Rtsp(source) => source.take_receivers(),
            MediaSource::Mjpeg(source) => source.take_receivers(),
        }
    }

    /// Subscribe to the source's H.264 access units (frame extraction input).
    pub fn subscribe_h264(&self) -> broadcast::Receiver<Bytes> {
        match self {
            MediaSource::Rtsp(source) => source.subscribe_h264(),
            MediaSource::Mjpeg(source) => source.subscribe_h264(),
        }
    }

    /// Pump media until the stream ends or the bridge dies.
    pub async fn run_producer(&mut self) -> Result<()> {
        match self {
            MediaSource::Rtsp(source) => source.run_producer().await,
            MediaSource::Mjpeg(source) => source.run_producer().await,
        }
    }

    /// Release the bridge and any helper process.
    pub async fn close(&mut self) {
        match self {
            MediaSource::Rtsp(source) => source.close().await,
            MediaSource::Mjpeg(source) => source.close().await,
        }
    }

    pub fn bridge_id(&self) -> &str {
        match self {
            MediaSource::Rtsp(source) => source.bridge_id(),
            MediaSource::Mjpeg(source) => source.bridge_id(),
        }
    }
}
