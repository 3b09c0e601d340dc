//! Frames and the single-slot "latest frame wins" sink.
//!
//! The sink is backed by a `tokio::sync::watch` channel: a publish replaces
//! the slot atomically, readers borrow the current value without consuming
//! it, and nothing is ever queued.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::watch;

// ── Frame ────────────────────────────────────────────────────────

/// One complete JPEG payload plus the time it was captured (node side) or
/// completed (hub side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
    captured_at: SystemTime,
}

impl Frame {
    pub fn new(payload: Bytes, captured_at: SystemTime) -> Self {
        Self {
            payload,
            captured_at,
        }
    }

    /// A frame stamped with the current wall-clock time.
    pub fn now(payload: Bytes) -> Self {
        Self::new(payload, SystemTime::now())
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ── FrameSink ────────────────────────────────────────────────────

/// Single-slot buffer holding the most recent frame.
///
/// Cloning a `FrameSink` yields another handle to the same slot. The hub's
/// receive loop is the only publisher; any number of readers may `peek`.
#[derive(Debug, Clone)]
pub struct FrameSink {
    slot: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Replace the slot contents. Never blocks; an unread previous frame is
    /// discarded.
    pub fn publish(&self, frame: Frame) {
        self.slot.send_replace(Some(Arc::new(frame)));
    }

    /// The current frame, if any, without consuming it.
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.slot.borrow().clone()
    }

    /// A receiver that is notified whenever a new frame is published.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.slot.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────────
