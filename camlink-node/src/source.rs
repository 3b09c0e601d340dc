//! Capture source that replays JPEG files from a directory.
//!
//! Stands in for camera hardware: each capture loads the next file in name
//! order, wrapping at the end. The buffer is trimmed to its `SOI..EOI` span
//! the same way a camera FIFO read is.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use camlink_core::CaptureSource;
use camlink_core::jpeg;

// ── DirectorySource ──────────────────────────────────────────────

pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
    current: Option<Bytes>,
}

impl DirectorySource {
    /// Scan `dir` for `.jpg` / `.jpeg` files.
    ///
    /// Fails if the directory cannot be read or holds no JPEG files.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_jpeg_name(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no .jpg files in {}", dir.display()),
            ));
        }
        files.sort();
        info!("replaying {} frames from {}", files.len(), dir.display());
        Ok(Self {
            files,
            next: 0,
            current: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_jpeg_name(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

#[async_trait]
impl CaptureSource for DirectorySource {
    async fn capture(&mut self) {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        self.current = match tokio::fs::read(path).await {
            Ok(buf) => Some(Bytes::from(buf)),
            Err(e) => {
                warn!("read {}: {e}", path.display());
                None
            }
        };
    }

    async fn read_encoded_frame(&mut self, max_size: Option<usize>) -> Bytes {
        let Some(buf) = self.current.take() else {
            return Bytes::new();
        };
        let Some(span) = jpeg::extract(&buf) else {
            debug!("capture without JPEG markers ({} bytes)", buf.len());
            return Bytes::new();
        };
        if max_size.is_some_and(|max| span.len() > max) {
            debug!("capture of {} bytes exceeds limit", span.len());
            return Bytes::new();
        }
        buf.slice_ref(span)
    }
}

// ── Tests ────────────────────────────────────────────────────────
