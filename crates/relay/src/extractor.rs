//! Per-stream JPEG frame extraction.
//!
//! Each live camera stream runs one extractor: an external decoder reads
//! the producer's H.264 and emits one JPEG per configured interval. Every
//! frame is persisted, announced on the CV bus, and accumulated into
//! batches.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cv::{CvEventBus, FrameRecord};
use crate::storage::StorageManager;

/// Incremental splitter pulling complete JPEGs (SOI..EOI) out of the
/// decoder's image2pipe output.
struct JpegSplitter {
    buf: BytesMut,
}

impl JpegSplitter {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            // Align the buffer to the next SOI marker
            let Some(soi) = find_marker(&self.buf, [0xFF, 0xD8]) else {
                // A trailing 0xFF may be the first half of a split marker
                if self.buf.last() == Some(&0xFF) {
                    let tail = self.buf.len() - 1;
                    let _ = self.buf.split_to(tail);
                } else {
                    self.buf.clear();
                }
                break;
            };
            if soi > 0 {
                let _ = self.buf.split_to(soi);
            }
            let Some(eoi) = find_marker(&self.buf[2..], [0xFF, 0xD9]) else {
                break;
            };
            frames.push(self.buf.split_to(eoi + 4).freeze());
        }
        frames
    }
}

fn find_marker(data: &[u8], marker: [u8; 2]) -> Option<usize> {
    data.windows(2).position(|w| w == marker)
}

/// Frame bookkeeping shared by the decode loop: persistence, bus emission
/// and batch accumulation.
struct ExtractorCore {
    service_id: String,
    interval_seconds: u64,
    batch_size: usize,
    storage: Arc<StorageManager>,
    bus: Arc<CvEventBus>,
    sequence: u64,
    batch: Vec<String>,
}

impl ExtractorCore {
    async fn handle_jpeg(&mut self, bytes: Bytes) -> Result<()> {
        let frame_uuid = Uuid::new_v4().to_string();
        self.storage
            .store_frame(&frame_uuid, &self.service_id, &bytes)
            .await?;

        self.bus
            .emit_frame(&FrameRecord {
                frame_uuid: frame_uuid.clone(),
                service_id: self.service_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
                sequence: self.sequence,
            })
            .await;
        self.sequence += 1;

        self.batch.push(frame_uuid);
        if self.batch.len() >= self.batch_size {
            let frames = std::mem::take(&mut self.batch);
            let duration_seconds = frames.len() as u64 * self.interval_seconds;
            self.bus
                .emit_frame_batch(&self.service_id, &frames, duration_seconds)
                .await;
        }
        Ok(())
    }
}

/// Handle to a running extraction loop.
pub struct FrameExtractor {
    task: tokio::task::JoinHandle<()>,
}

impl FrameExtractor {
    /// Start extracting frames for one service from its H.264 tee.
    pub fn spawn(
        service_id: String,
        interval_seconds: u64,
        batch_size: usize,
        h264: broadcast::Receiver<Bytes>,
        storage: Arc<StorageManager>,
        bus: Arc<CvEventBus>,
    ) -> Self {
        let core = ExtractorCore {
            service_id: service_id.clone(),
            interval_seconds,
            batch_size,
            storage,
            bus,
            sequence: 0,
            batch: Vec::new(),
        };
        let task = tokio::spawn(async move {
            if let Err(e) = run_extractor(core, h264).await {
                tracing::warn!(%service_id, "Frame extraction stopped: {e:#}");
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn run_extractor(mut core: ExtractorCore, mut h264: broadcast::Receiver<Bytes>) -> Result<()> {
    let mut decoder = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-vf",
            &format!("fps=1/{}", core.interval_seconds),
            "-f",
            "image2pipe",
            "-c:v",
            "mjpeg",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn frame decoder (is ffmpeg installed?)")?;

    let mut stdin = decoder
        .stdin
        .take()
        .ok_or_else(|| anyhow!("decoder stdin missing"))?;
    let mut stdout = decoder
        .stdout
        .take()
        .ok_or_else(|| anyhow!("decoder stdout missing"))?;

    // Feed access units in; decoded JPEGs come back on stdout. The decoder
    // cannot start mid-GOP, so hold everything until the first keyframe.
    let feeder = tokio::spawn(async move {
        let mut saw_idr = false;
        loop {
            match h264.recv().await {
                Ok(unit) => {
                    if !saw_idr {
                        if !crate::media::h264::contains_idr(&unit) {
                            continue;
                        }
                        saw_idr = true;
                    }
                    if stdin.write_all(&unit).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Extractor lagged behind the producer");
                    // The stream is cut; wait for the next keyframe
                    saw_idr = false;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        // Dropping stdin signals EOF to the decoder
    });

    let mut splitter = JpegSplitter::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = stdout.read(&mut chunk).await.context("decoder read failed")?;
        if n == 0 {
            break;
        }
        for jpeg in splitter.push(&chunk[..n]) {
            if let Err(e) = core.handle_jpeg(jpeg).await {
                tracing::error!(service_id = %core.service_id, "Failed to handle frame: {e:#}");
            }
        }
    }

    feeder.abort();
    let status = decoder.wait().await?;
    anyhow::bail!("decoder exited: {status}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventBroadcaster;
    use crate::db::Db;
    use crate::registry::ServiceRegistry;

    const JPEG_A: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x01, 0x02, 0xFF, 0xD9];
    const JPEG_B: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x03, 0x04, 0x05, 0xFF, 0xD9];

    #[test]
    fn jpeg_splitter_single_frame() {
        let mut splitter = JpegSplitter::new();
        let frames = splitter.push(JPEG_A);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], JPEG_A);
    }

    #[test]
    fn jpeg_splitter_multiple_and_partial() {
        let mut splitter = JpegSplitter::new();
        let mut stream = JPEG_A.to_vec();
        stream.extend_from_slice(JPEG_B);
        stream.extend_from_slice(&JPEG_A[..4]); // partial third frame

        let frames = splitter.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], JPEG_A);
        assert_eq!(&frames[1][..], JPEG_B);

        // Completing the third frame yields it
        let frames = splitter.push(&JPEG_A[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], JPEG_A);
    }

    #[test]
    fn jpeg_splitter_skips_leading_garbage() {
        let mut splitter = JpegSplitter::new();
        let mut stream = vec![0x00, 0x01, 0x02];
        stream.extend_from_slice(JPEG_A);
        let frames = splitter.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], JPEG_A);
    }

    #[test]
    fn jpeg_splitter_byte_at_a_time() {
        let mut splitter = JpegSplitter::new();
        let mut frames = Vec::new();
        for &byte in JPEG_A {
            frames.extend(splitter.push(&[byte]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], JPEG_A);
    }

    fn core(batch_size: usize) -> (ExtractorCore, tokio::sync::mpsc::Receiver<String>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let storage =
            Arc::new(StorageManager::new(&dir.path().join("frames"), Arc::clone(&db)).unwrap());
        let bus = Arc::new(CvEventBus::new(
            db,
            Arc::new(ServiceRegistry::new()),
            Arc::new(EventBroadcaster::new()),
        ));
        let worker_rx = futures_util::FutureExt::now_or_never(bus.registry.register())
            .expect("register is immediate")
            .2;
        (
            ExtractorCore {
                service_id: "s1".to_string(),
                interval_seconds: 5,
                batch_size,
                storage,
                bus,
                sequence: 0,
                batch: Vec::new(),
            },
            worker_rx,
            dir,
        )
    }

    #[tokio::test]
    async fn each_jpeg_is_stored_and_emitted() {
        let (mut core, mut worker_rx, _dir) = core(10);

        for _ in 0..3 {
            core.handle_jpeg(Bytes::from_static(JPEG_A)).await.unwrap();
        }

        let mut frame_uuids = Vec::new();
        for expected_seq in 0..3u64 {
            let envelope: serde_json::Value =
                serde_json::from_str(&worker_rx.recv().await.unwrap()).unwrap();
            assert_eq!(envelope["type"], "frame");
            assert_eq!(envelope["data"]["service_id"], "s1");
            assert_eq!(envelope["data"]["sequence"], expected_seq);
            frame_uuids.push(envelope["data"]["frame_uuid"].as_str().unwrap().to_string());
        }
        // Distinct ids, all stored
        assert_eq!(
            frame_uuids.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
        for frame_uuid in &frame_uuids {
            let bytes = core.storage.read_frame(frame_uuid).await.unwrap().unwrap();
            assert_eq!(&bytes[..], JPEG_A);
        }
    }

    #[tokio::test]
    async fn batch_emitted_at_configured_size() {
        let (mut core, mut worker_rx, _dir) = core(2);

        for _ in 0..2 {
            core.handle_jpeg(Bytes::from_static(JPEG_A)).await.unwrap();
        }

        // Two frame events, then the batch
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let envelope: serde_json::Value =
                serde_json::from_str(&worker_rx.recv().await.unwrap()).unwrap();
            kinds.push(envelope["type"].as_str().unwrap().to_string());
            if envelope["type"] == "frame_batch" {
                assert_eq!(envelope["data"]["frame_uuids"].as_array().unwrap().len(), 2);
                // 2 frames at 5-second intervals
                assert_eq!(envelope["data"]["metadata"]["duration_seconds"], 10);
            }
        }
        assert_eq!(kinds, vec!["frame", "frame", "frame_batch"]);

        // Accumulator reset: the next frame starts a new batch
        core.handle_jpeg(Bytes::from_static(JPEG_A)).await.unwrap();
        assert_eq!(core.batch.len(), 1);
    }
}
