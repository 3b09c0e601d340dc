//! Snapshot writer.
//!
//! Mirrors the freshest frame into a file so any image viewer can display
//! it. Each write goes to a temporary file in the same directory that is
//! then renamed over the target, so readers never see a partial JPEG.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use camlink_core::Frame;
use camlink_core::supervisor::wait_for_stop;

/// Replace `path` with `data` atomically.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`write_atomic`] off the async runtime.
pub async fn save_frame(path: &Path, frame: &Frame) -> io::Result<()> {
    let path = path.to_path_buf();
    let data = frame.payload().clone();
    tokio::task::spawn_blocking(move || write_atomic(&path, &data))
        .await
        .map_err(io::Error::other)?
}

// ── SnapshotWriter ───────────────────────────────────────────────

/// Rewrites one file whenever the hub publishes a new frame.
pub struct SnapshotWriter {
    path: PathBuf,
    min_interval: Duration,
    written: u64,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            path: path.into(),
            min_interval,
            written: 0,
        }
    }

    /// Follow `frames` until the sender is dropped or `running` clears.
    ///
    /// Frames arriving faster than `min_interval` collapse into the latest.
    /// Returns the number of files written.
    pub async fn run(
        mut self,
        mut frames: watch::Receiver<Option<Arc<Frame>>>,
        running: Arc<AtomicBool>,
    ) -> u64 {
        while running.load(Ordering::SeqCst) {
            tokio::select! {
                changed = frames.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wait_for_stop(&running) => break,
            }

            let latest = frames.borrow_and_update().clone();
            if let Some(frame) = latest {
                match save_frame(&self.path, &frame).await {
                    Ok(()) => {
                        self.written += 1;
                        debug!("snapshot of {} bytes written to {}", frame.len(), self.path.display());
                    }
                    Err(e) => warn!("snapshot {}: {e}", self.path.display()),
                }
            }
            tokio::time::sleep(self.min_interval).await;
        }
        self.written
    }
}

// ── Tests ────────────────────────────────────────────────────────
