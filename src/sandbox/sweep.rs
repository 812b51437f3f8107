//! Periodic removal of temp artifacts abandoned by a crashed server.
//!
//! A normal invocation always deletes its own files; this only catches
//! what a killed process left behind.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::ARTIFACT_PREFIX;

/// Artifacts older than this are considered orphaned.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Deletes files in `dir` whose name starts with the artifact prefix and
/// whose mtime is older than `max_age`. Returns how many were removed.
///
/// Per-file errors are logged and skipped; only an unreadable directory
/// fails the sweep.
pub fn sweep_stale(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };

        if !entry.file_name().to_string_lossy().starts_with(ARTIFACT_PREFIX) {
            continue;
        }

        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Removed stale artifact {}", entry.path().display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale artifact {}: {e}", entry.path().display()),
        }
    }

    Ok(removed)
}

/// Spawns the background sweep, running once at startup and then every
/// `interval`.
pub fn spawn_sweeper(dir: PathBuf, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let sweep_dir = dir.clone();
            match tokio::task::spawn_blocking(move || sweep_stale(&sweep_dir, max_age)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => info!("Swept {n} stale artifact(s) from {}", dir.display()),
                Ok(Err(e)) => warn!("Artifact sweep of {} failed: {e}", dir.display()),
                Err(e) => warn!("Artifact sweep task failed: {e}"),
            }
        }
    })
}
