use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::Db;

/// Content-addressed frame files on disk: `<frames_dir>/<uuid>.jpg`, with a
/// row per frame in storage_items for retention bookkeeping.
pub struct StorageManager {
    frames_dir: PathBuf,
    db: Arc<Db>,
}

impl StorageManager {
    pub fn new(frames_dir: &Path, db: Arc<Db>) -> Result<Self> {
        std::fs::create_dir_all(frames_dir)
            .with_context(|| format!("Failed to create {}", frames_dir.display()))?;
        Ok(Self {
            frames_dir: frames_dir.to_path_buf(),
            db,
        })
    }

    /// Persist one JPEG frame. Returns the file path it landed at.
    pub async fn store_frame(
        &self,
        frame_id: &str,
        service_id: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.frame_path(frame_id)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write frame {frame_id}"))?;
        self.db
            .insert_storage_item(frame_id, service_id, &path.to_string_lossy())?;
        Ok(path)
    }

    /// Raw JPEG bytes of a stored frame, or None when it doesn't exist.
    pub async fn read_frame(&self, frame_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.frame_path(frame_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read frame {frame_id}")),
        }
    }

    /// Internal-only delete.
    pub async fn delete_frame(&self, frame_id: &str) -> Result<()> {
        let path = self.frame_path(frame_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete frame {frame_id}")),
        }
    }

    /// Frame ids are uuids; anything else (path traversal attempts included)
    /// is rejected before touching the filesystem.
    fn frame_path(&self, frame_id: &str) -> Result<PathBuf> {
        let parsed =
            Uuid::parse_str(frame_id).with_context(|| format!("invalid frame id {frame_id:?}"))?;
        Ok(self.frames_dir.join(format!("{parsed}.jpg")))
    }

    /// Periodically delete frames older than the retention horizon.
    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        retention_seconds: u64,
    ) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let cutoff =
                    chrono::Utc::now() - chrono::Duration::seconds(retention_seconds as i64);
                let doomed = match storage.db.prune_storage_items(cutoff) {
                    Ok(paths) => paths,
                    Err(e) => {
                        tracing::error!("Retention sweep query failed: {e}");
                        continue;
                    }
                };
                if doomed.is_empty() {
                    continue;
                }
                tracing::info!(frames = doomed.len(), "Sweeping expired frames");
                for frame_id in doomed {
                    if let Err(e) = storage.delete_frame(&frame_id).await {
                        tracing::warn!(%frame_id, "Failed to delete expired frame: {e:#}");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (StorageManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let storage = StorageManager::new(&dir.path().join("frames"), db).unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn store_and_read_roundtrip() {
        let (storage, _dir) = storage();
        let frame_id = Uuid::new_v4().to_string();
        let path = storage
            .store_frame(&frame_id, "s1", b"\xff\xd8jpeg\xff\xd9")
            .await
            .unwrap();
        assert!(path.ends_with(format!("{frame_id}.jpg")));

        let bytes = storage.read_frame(&frame_id).await.unwrap().unwrap();
        assert_eq!(bytes, b"\xff\xd8jpeg\xff\xd9");
    }

    #[tokio::test]
    async fn missing_frame_is_none() {
        let (storage, _dir) = storage();
        let frame_id = Uuid::new_v4().to_string();
        assert!(storage.read_frame(&frame_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn traversal_ids_rejected() {
        let (storage, _dir) = storage();
        assert!(storage.read_frame("../../etc/passwd").await.is_err());
        assert!(storage.read_frame("not-a-uuid").await.is_err());
        assert!(
            storage
                .store_frame("../escape", "s1", b"x")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (storage, _dir) = storage();
        let frame_id = Uuid::new_v4().to_string();
        storage.store_frame(&frame_id, "s1", b"x").await.unwrap();
        storage.delete_frame(&frame_id).await.unwrap();
        storage.delete_frame(&frame_id).await.unwrap();
        assert!(storage.read_frame(&frame_id).await.unwrap().is_none());
    }
}
