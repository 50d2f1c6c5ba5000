//! Relay token persistence.
//!
//! The token survives restarts so a node registers straight away instead of
//! asking for authorization again.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// Load the persisted token, if any. An unreadable file is treated as
/// absent so a corrupt state degrades to re-authorization, not a crash.
pub fn load(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim().to_string();
            if token.is_empty() { None } else { Some(token) }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read token file {}: {e}", path.display());
            None
        }
    }
}

/// Persist the token with owner-only permissions.
pub fn store(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(token.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Forget a token the relay no longer accepts.
pub fn clear(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove token file {}: {e}", path.display());
    }
}
