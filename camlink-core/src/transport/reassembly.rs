//! Frame reassembly from chunk datagrams.
//!
//! Exactly one incomplete frame is held at a time. Chunks are placed by
//! index, so arrival order within a frame does not matter. A chunk for a
//! newer frame id discards the incomplete one, which is never published even
//! if its missing chunks show up later. Frame ids are compared with u16
//! serial-number arithmetic so the sequence may wrap.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::transport::chunk::ChunkHeader;

/// `a` is newer than `b` under u16 serial-number arithmetic.
pub fn is_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

// ── ReassemblyStats ──────────────────────────────────────────────

/// Counters for a reassembler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Frames fully reassembled.
    pub completed: u64,
    /// Incomplete frames discarded because a newer id arrived.
    pub superseded: u64,
    /// Incomplete frames discarded for exceeding the timeout.
    pub expired: u64,
    /// Frames abandoned for exceeding the size limit.
    pub oversize: u64,
    /// Chunks dropped for belonging to an older frame.
    pub stale: u64,
    /// Chunks already received, or for an already closed frame.
    pub duplicates: u64,
    /// Chunks inconsistent with their frame.
    pub malformed: u64,
}

// ── ReassemblyContext ────────────────────────────────────────────

#[derive(Debug)]
struct ReassemblyContext {
    frame_id: u16,
    total_chunks: u16,
    /// Slot per chunk index; `Some` marks it received.
    chunks: Vec<Option<Bytes>>,
    received: u16,
    bytes: usize,
    first_seen_at: Instant,
}

impl ReassemblyContext {
    fn new(frame_id: u16, total_chunks: u16, now: Instant) -> Self {
        Self {
            frame_id,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
            received: 0,
            bytes: 0,
            first_seen_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_chunks
    }

    fn assemble(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.bytes);
        for chunk in self.chunks.into_iter().flatten() {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

// ── Reassembler ──────────────────────────────────────────────────

/// Rebuilds frames from chunks, holding at most one incomplete frame.
#[derive(Debug)]
pub struct Reassembler {
    current: Option<ReassemblyContext>,
    /// Newest frame id accepted; older ids are stale.
    newest: Option<u16>,
    /// Id of the last context that was completed or abandoned.
    closed: Option<u16>,
    last_progress: Option<Instant>,
    timeout: Duration,
    max_frame_len: Option<usize>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_frame_len: Option<usize>) -> Self {
        Self {
            current: None,
            newest: None,
            closed: None,
            last_progress: None,
            timeout,
            max_frame_len,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Frame id of the incomplete frame being collected, if any.
    pub fn in_flight(&self) -> Option<u16> {
        self.current.as_ref().map(|ctx| ctx.frame_id)
    }

    /// Forget everything, as at the start of a new session.
    pub fn reset(&mut self) {
        self.current = None;
        self.newest = None;
        self.closed = None;
        self.last_progress = None;
    }

    /// Feed one chunk. Returns the full payload when this chunk completes a
    /// frame.
    pub fn accept(&mut self, header: &ChunkHeader, payload: &[u8], now: Instant) -> Option<Bytes> {
        if header.validate().is_err() || payload.len() != header.payload_length as usize {
            self.stats.malformed += 1;
            return None;
        }
        self.expire(now);

        let id = header.frame_id;
        if let Some(newest) = self.newest {
            if id != newest && !is_newer(id, newest) {
                trace!("stale chunk for frame {id} (newest {newest})");
                self.stats.stale += 1;
                return None;
            }
        }
        if self.closed == Some(id) {
            self.stats.duplicates += 1;
            return None;
        }

        if let Some(old) = self.current.take_if(|ctx| ctx.frame_id != id) {
            debug!(
                "frame {} superseded by {id} with {}/{} chunks",
                old.frame_id, old.received, old.total_chunks
            );
            self.stats.superseded += 1;
        }

        let ctx = self
            .current
            .get_or_insert_with(|| ReassemblyContext::new(id, header.total_chunks, now));
        if ctx.total_chunks != header.total_chunks {
            self.stats.malformed += 1;
            return None;
        }
        self.newest = Some(id);
        self.last_progress = Some(now);

        let slot = &mut ctx.chunks[header.chunk_id as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return None;
        }

        let bytes = ctx.bytes + payload.len();
        if self.max_frame_len.is_some_and(|max| bytes > max) {
            warn!("frame {id} exceeds size limit after {bytes} bytes; abandoning");
            self.stats.oversize += 1;
            self.current = None;
            self.closed = Some(id);
            return None;
        }

        *slot = Some(Bytes::copy_from_slice(payload));
        ctx.received += 1;
        ctx.bytes = bytes;
        if !ctx.is_complete() {
            return None;
        }

        let ctx = self.current.take()?;
        self.closed = Some(id);
        self.stats.completed += 1;
        Some(ctx.assemble())
    }

    /// Drop an incomplete frame older than the timeout, and forget the
    /// ordering floor once nothing has arrived for that long.
    fn expire(&mut self, now: Instant) {
        if let Some(ctx) = self
            .current
            .take_if(|ctx| now.saturating_duration_since(ctx.first_seen_at) >= self.timeout)
        {
            debug!(
                "frame {} expired with {}/{} chunks",
                ctx.frame_id, ctx.received, ctx.total_chunks
            );
            self.stats.expired += 1;
        }

        let idle = self
            .last_progress
            .is_some_and(|t| now.saturating_duration_since(t) >= self.timeout);
        if idle {
            trace!("no chunks for {:?}; accepting any frame id", self.timeout);
            self.newest = None;
            self.closed = None;
            self.last_progress = None;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
