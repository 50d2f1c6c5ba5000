//! RTSP over a bridge.
//!
//! The client's underlying connection IS the bridge byte stream: requests go
//! out as DATA payloads, responses and interleaved RTP come back through the
//! bridge sink. No TCP is dialed on the relay, and the original RTSP URL is
//! preserved so camera-side auth and paths keep working.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc};
use unblink_protocol::ServiceDescriptor;

use crate::media::h264::RtpH264Depacketizer;
use crate::media::{
    H264_TEE_CAPACITY, MediaReceiver, TRACK_QUEUE_CAPACITY, TrackCodec, TrackPacket,
};
use crate::node_conn::NodeHandle;

const USER_AGENT: &str = "unblink-relay";

/// Byte stream over one bridge: writes become DATA envelopes, reads drain
/// the bridge sink into a parse buffer.
struct BridgeIo {
    node: Arc<NodeHandle>,
    bridge_id: String,
    sink: mpsc::Receiver<Bytes>,
    buf: BytesMut,
}

impl BridgeIo {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.node.send_data(&self.bridge_id, Bytes::from(bytes)).await
    }

    /// Pull at least one more chunk into the buffer.
    async fn fill(&mut self) -> Result<()> {
        let chunk = self
            .sink
            .recv()
            .await
            .ok_or_else(|| anyhow!("bridge closed"))?;
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }
}

/// One media section of an SDP description.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SdpMedia {
    pub kind: String,
    pub payload_type: u8,
    pub codec: Option<(String, u32)>,
    pub fmtp: Option<String>,
    pub control: Option<String>,
}

/// Parse the media sections out of an SDP body, keeping only the first
/// codec (payload type) of each `m=` line.
pub(crate) fn parse_sdp(body: &str) -> Vec<SdpMedia> {
    let mut media = Vec::new();
    let mut current: Option<SdpMedia> = None;

    for line in body.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("m=") {
            if let Some(section) = current.take() {
                media.push(section);
            }
            // m=<kind> <port> <proto> <pt> [pt...]
            let mut parts = rest.split_whitespace();
            let kind = parts.next().unwrap_or_default().to_string();
            let payload_type = parts
                .nth(2)
                .and_then(|pt| pt.parse().ok())
                .unwrap_or(0u8);
            current = Some(SdpMedia {
                kind,
                payload_type,
                codec: None,
                fmtp: None,
                control: None,
            });
        } else if let Some(section) = current.as_mut() {
            if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                // a=rtpmap:<pt> <name>/<clock>[/...]
                let mut parts = rest.split_whitespace();
                let pt: Option<u8> = parts.next().and_then(|p| p.parse().ok());
                if pt == Some(section.payload_type)
                    && section.codec.is_none()
                    && let Some(spec) = parts.next()
                {
                    let mut spec = spec.split('/');
                    let name = spec.next().unwrap_or_default().to_string();
                    let clock = spec.next().and_then(|c| c.parse().ok()).unwrap_or(90_000);
                    section.codec = Some((name, clock));
                }
            } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
                let mut parts = rest.splitn(2, ' ');
                let pt: Option<u8> = parts.next().and_then(|p| p.parse().ok());
                if pt == Some(section.payload_type) {
                    section.fmtp = parts.next().map(|s| s.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("a=control:") {
                section.control = Some(rest.to_string());
            }
        }
    }
    if let Some(section) = current.take() {
        media.push(section);
    }
    media
}

/// Resolve a track control attribute against the session base URL.
pub(crate) fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("*") => base.to_string(),
        Some(control) if control.starts_with("rtsp://") => control.to_string(),
        Some(control) => format!("{}/{}", base.trim_end_matches('/'), control),
    }
}

/// A parsed RTSP response.
#[derive(Debug)]
struct RtspResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl RtspResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct Track {
    /// RTP interleaved channel (the RTCP channel is this + 1)
    channel: u8,
    codec: TrackCodec,
    packets: mpsc::Sender<TrackPacket>,
    depacketizer: Option<RtpH264Depacketizer>,
}

/// RTSP media source: DESCRIBE → SETUP (interleaved) → PLAY, then a producer
/// loop that routes RTP packets to their receivers.
pub struct RtspSource {
    io: BridgeIo,
    session: Option<String>,
    tracks: Vec<Track>,
    receivers: Vec<MediaReceiver>,
    h264_tee: broadcast::Sender<Bytes>,
    cseq: u32,
}

impl RtspSource {
    pub async fn connect(node: Arc<NodeHandle>, service: &ServiceDescriptor) -> Result<Self> {
        let bridge_id = node.open_bridge(service.clone()).await?;
        match Self::negotiate(Arc::clone(&node), bridge_id.clone(), service).await {
            Ok(source) => Ok(source),
            Err(e) => {
                node.close_bridge(&bridge_id).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        node: Arc<NodeHandle>,
        bridge_id: String,
        service: &ServiceDescriptor,
    ) -> Result<Self> {
        let sink = node
            .register_bridge_sink(&bridge_id)
            .await
            .ok_or_else(|| anyhow!("bridge disappeared during setup"))?;
        let url = service.url();
        let (h264_tee, _) = broadcast::channel(H264_TEE_CAPACITY);
        let mut source = Self {
            io: BridgeIo {
                node,
                bridge_id,
                sink,
                buf: BytesMut::with_capacity(8 * 1024),
            },
            session: None,
            tracks: Vec::new(),
            receivers: Vec::new(),
            h264_tee,
            cseq: 0,
        };

        // DESCRIBE
        let response = source
            .request("DESCRIBE", &url, &[("Accept", "application/sdp")])
            .await?;
        if response.status != 200 {
            bail!("DESCRIBE failed with status {}", response.status);
        }
        let base = response
            .header("Content-Base")
            .or_else(|| response.header("Content-Location"))
            .unwrap_or(&url)
            .trim_end_matches('/')
            .to_string();
        let media = parse_sdp(&response.body);
        if media.is_empty() {
            bail!("camera offered no media");
        }

        // SETUP each stream on its own interleaved channel pair
        let mut next_channel = 0u8;
        for section in &media {
            let control = resolve_control(&base, section.control.as_deref());
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                next_channel,
                next_channel + 1
            );
            let mut headers = vec![("Transport", transport.as_str())];
            let session_header;
            if let Some(session) = &source.session {
                session_header = session.clone();
                headers.push(("Session", session_header.as_str()));
            }
            let response = source.request("SETUP", &control, &headers).await?;
            if response.status != 200 {
                bail!(
                    "SETUP {} failed with status {}",
                    section.kind,
                    response.status
                );
            }
            if source.session.is_none() {
                source.session = response
                    .header("Session")
                    .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());
            }

            let codec = match &section.codec {
                Some((name, clock)) if name.eq_ignore_ascii_case("H264") => TrackCodec::H264 {
                    clock_rate: *clock,
                    fmtp: section.fmtp.clone().unwrap_or_default(),
                },
                Some((name, clock)) => TrackCodec::Other {
                    name: name.clone(),
                    clock_rate: *clock,
                },
                None => TrackCodec::Other {
                    name: "unknown".to_string(),
                    clock_rate: 90_000,
                },
            };
            let (tx, rx) = mpsc::channel(TRACK_QUEUE_CAPACITY);
            let depacketizer = (section.kind == "video" && codec.is_h264())
                .then(RtpH264Depacketizer::new);
            source.tracks.push(Track {
                channel: next_channel,
                codec: codec.clone(),
                packets: tx,
                depacketizer,
            });
            source.receivers.push(MediaReceiver {
                codec,
                flavor: crate::media::PacketFlavor::Rtp,
                packets: rx,
            });
            next_channel += 2;
        }

        if !source
            .tracks
            .iter()
            .any(|t| t.codec.is_h264())
        {
            bail!("camera offered no H.264 video track");
        }

        // PLAY on the session base
        let session = source
            .session
            .clone()
            .ok_or_else(|| anyhow!("SETUP returned no session id"))?;
        let response = source
            .request(
                "PLAY",
                &base,
                &[("Session", session.as_str()), ("Range", "npt=0.000-")],
            )
            .await?;
        if response.status != 200 {
            bail!("PLAY failed with status {}", response.status);
        }

        tracing::info!(
            bridge_id = %source.io.bridge_id,
            tracks = source.tracks.len(),
            "RTSP stream playing"
        );
        Ok(source)
    }

    pub fn take_receivers(&mut self) -> Vec<MediaReceiver> {
        std::mem::take(&mut self.receivers)
    }

    pub fn subscribe_h264(&self) -> broadcast::Receiver<Bytes> {
        self.h264_tee.subscribe()
    }

    pub fn bridge_id(&self) -> &str {
        &self.io.bridge_id
    }

    /// Read interleaved frames and route RTP to receivers until the bridge
    /// dies or the camera stops talking.
    pub async fn run_producer(&mut self) -> Result<()> {
        loop {
            match self.split_frame()? {
                Some(Interleaved::Rtp { channel, packet }) => self.route(channel, packet),
                Some(Interleaved::Rtsp(_response)) => {
                    // Server keepalives and announcements need no reply
                }
                None => self.io.fill().await.context("camera stream ended")?,
            }
        }
    }

    /// Try to pop one interleaved frame or RTSP message from the buffer.
    fn split_frame(&mut self) -> Result<Option<Interleaved>> {
        let buf = &mut self.io.buf;
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] == b'$' {
            if buf.len() < 4 {
                return Ok(None);
            }
            let channel = buf[1];
            let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if buf.len() < 4 + len {
                return Ok(None);
            }
            buf.advance(4);
            let packet = buf.split_to(len).freeze();
            return Ok(Some(Interleaved::Rtp { channel, packet }));
        }
        // An RTSP message: wait for a complete head, then its body
        let Some(head_end) = find_subsequence(buf, b"\r\n\r\n") else {
            // Desynchronized? Skip to the next interleave marker.
            if !buf.starts_with(b"RTSP/") && !looks_like_rtsp_start(buf) {
                if let Some(pos) = buf.iter().position(|&b| b == b'$') {
                    tracing::warn!("Skipping {pos} unparsable bytes on RTSP bridge");
                    buf.advance(pos);
                    return self.split_frame();
                }
            }
            return Ok(None);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("Content-Length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        if buf.len() < head_end + 4 + content_length {
            return Ok(None);
        }
        buf.advance(head_end + 4);
        let body = buf.split_to(content_length).freeze();
        let message = format!("{head}\r\n\r\n{}", String::from_utf8_lossy(&body));
        Ok(Some(Interleaved::Rtsp(message)))
    }

    fn route(&mut self, channel: u8, packet: Bytes) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.channel == channel) else {
            // Odd channels carry RTCP; ignore quietly
            if channel % 2 == 0 {
                tracing::trace!(channel, "RTP on unknown channel");
            }
            return;
        };
        let Some((payload, marker)) = rtp_payload(&packet) else {
            tracing::trace!(channel, "Malformed RTP packet dropped");
            return;
        };
        if let Some(depacketizer) = track.depacketizer.as_mut()
            && let Some(unit) = depacketizer.push(payload, marker)
        {
            // Tee errors just mean nobody is extracting frames right now
            let _ = self.h264_tee.send(unit);
        }
        if track
            .packets
            .try_send(TrackPacket::Rtp(packet))
            .is_err()
        {
            tracing::trace!(channel, "Receiver queue full, RTP packet dropped");
        }
    }

    async fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<RtspResponse> {
        self.cseq += 1;
        let mut request = format!("{method} {url} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        request.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        self.io.send(request.into_bytes()).await?;

        // Interleaved packets may arrive between request and response once
        // earlier tracks are playing; route them instead of dropping.
        loop {
            match self.split_frame()? {
                Some(Interleaved::Rtp { channel, packet }) => self.route(channel, packet),
                Some(Interleaved::Rtsp(message)) => return parse_response(&message),
                None => self
                    .io
                    .fill()
                    .await
                    .with_context(|| format!("camera closed during {method}"))?,
            }
        }
    }

    pub async fn close(&mut self) {
        // Best-effort TEARDOWN; the bridge teardown is what actually matters
        if let Some(session) = self.session.take() {
            self.cseq += 1;
            let request = format!(
                "TEARDOWN * RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\n\r\n",
                self.cseq
            );
            let _ = self.io.send(request.into_bytes()).await;
        }
        self.io.node.close_bridge(&self.io.bridge_id).await;
    }
}

enum Interleaved {
    Rtp { channel: u8, packet: Bytes },
    Rtsp(String),
}

fn looks_like_rtsp_start(buf: &[u8]) -> bool {
    // Partial "RTSP/" prefix at the end of the buffer
    let probe = &b"RTSP/"[..buf.len().min(5)];
    buf.starts_with(probe)
}

fn parse_response(message: &str) -> Result<RtspResponse> {
    let (head, body) = message
        .split_once("\r\n\r\n")
        .unwrap_or((message, ""));
    let mut lines = head.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("empty RTSP response"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("bad RTSP status line: {status_line}"))?;
    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Ok(RtspResponse {
        status,
        headers,
        body: body.to_string(),
    })
}

/// Strip the RTP header; returns (payload, marker) or None when malformed.
fn rtp_payload(packet: &[u8]) -> Option<(&[u8], bool)> {
    if packet.len() < 12 || packet[0] >> 6 != 2 {
        return None;
    }
    let csrc_count = (packet[0] & 0x0F) as usize;
    let has_extension = packet[0] & 0x10 != 0;
    let marker = packet[1] & 0x80 != 0;
    let mut offset = 12 + 4 * csrc_count;
    if has_extension {
        if packet.len() < offset + 4 {
            return None;
        }
        let words = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + 4 * words;
    }
    if packet.len() < offset {
        return None;
    }
    let mut end = packet.len();
    // Padding flag: last byte counts the pad bytes
    if packet[0] & 0x20 != 0 {
        let pad = packet[end - 1] as usize;
        if pad == 0 || pad > end - offset {
            return None;
        }
        end -= pad;
    }
    Some((&packet[offset..end], marker))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
