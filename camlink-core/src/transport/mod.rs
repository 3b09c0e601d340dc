//! Frame transports.
//!
//! Two wire encodings carry JPEG frames, both behind [`FrameTransport`] so the
//! capture loop and the server session never care which one is active:
//!
//! | Module       | Purpose                                                   |
//! |--------------|-----------------------------------------------------------|
//! | `stream`     | 4-byte big-endian length prefix over TCP                  |
//! | `chunk`      | Chunk / whole-frame datagram packet layout                |
//! | `reassembly` | Rebuilds frames from chunks that arrive in any order      |
//! | `datagram`   | UDP transport driving `chunk` and `reassembly`            |
//!
//! A [`Connector`] yields a ready transport for each new session; the
//! [`ConnectionSupervisor`](crate::supervisor::ConnectionSupervisor) is the
//! only owner of the result.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::command::CommandVerb;
use crate::error::LinkError;

pub mod chunk;
pub mod datagram;
pub mod reassembly;
pub mod stream;

pub use chunk::{ChunkHeader, DatagramPacket};
pub use datagram::{DatagramTransport, UdpConnector};
pub use reassembly::{ReassemblyStats, Reassembler};
pub use stream::{FrameCodec, StreamTransport, TcpAcceptor, TcpConnector};

// ── TransportKind ────────────────────────────────────────────────

/// Which wire encoding a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed frames over TCP.
    #[default]
    Stream,
    /// Chunked frames over UDP.
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Datagram => f.write_str("datagram"),
        }
    }
}

// ── TransportOptions ─────────────────────────────────────────────

/// Timeouts and limits shared by both transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound on a single `decode_next` wait.
    pub read_timeout: Duration,
    /// Upper bound on writing one frame or command.
    pub write_timeout: Duration,
    /// Upper bound on connect / accept.
    pub connect_timeout: Duration,
    /// Largest frame accepted by a decoder; `None` disables the guard.
    pub max_frame_len: Option<usize>,
    /// Payload bytes per datagram chunk.
    pub chunk_payload: usize,
    /// Send frames that fit one chunk as a single whole-frame datagram.
    pub single_packet_frames: bool,
    /// Drop incomplete reassemblies (and the frame-id ordering floor) after
    /// this long without progress.
    pub reassembly_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            max_frame_len: Some(10_000_000),
            chunk_payload: 1400,
            single_packet_frames: true,
            reassembly_timeout: Duration::from_secs(2),
        }
    }
}

// ── Decoded ──────────────────────────────────────────────────────

/// Outcome of one [`FrameTransport::decode_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, validated payload.
    Frame(Bytes),
    /// Nothing complete yet (timeout, partial data, dropped packet). Retry.
    Incomplete,
}

// ── FrameTransport ───────────────────────────────────────────────

/// One live session's wire, carrying frames one way and commands the other.
#[async_trait]
pub trait FrameTransport: Send {
    /// Encode `payload` with this transport's framing and transmit it.
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), LinkError>;

    /// Wait up to the configured read timeout for the next complete frame.
    ///
    /// Timeouts yield `Ok(Decoded::Incomplete)`; only session failures are
    /// returned as `Err`.
    async fn decode_next(&mut self) -> Result<Decoded, LinkError>;

    /// Transmit a control verb to the peer.
    async fn send_command(&mut self, verb: CommandVerb) -> Result<(), LinkError>;

    /// Wait up to `wait` for a control verb. A zero `wait` polls once.
    async fn poll_command(&mut self, wait: Duration) -> Result<Option<CommandVerb>, LinkError>;

    /// Address of the remote end.
    fn peer_addr(&self) -> SocketAddr;

    /// Frames and packets dropped so far as protocol violations.
    fn dropped_units(&self) -> u64 {
        0
    }

    fn kind(&self) -> TransportKind;
}

// ── Connector ────────────────────────────────────────────────────

/// Produces a ready-to-use transport for a new session.
#[async_trait]
pub trait Connector: Send {
    type Transport: FrameTransport;

    /// Establish a transport. Transient errors (accept/connect timeouts) are
    /// re-polled by the supervisor without backoff.
    async fn connect(&mut self) -> Result<Self::Transport, LinkError>;

    /// True when a newer peer is waiting to replace the current session.
    async fn superseded(&mut self) -> bool {
        false
    }

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Resolve `host:port` to the first matching socket address.
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr, LinkError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|_| LinkError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| LinkError::Resolve(addr.to_string()))
}
