//! # camlink-core
//!
//! Frame transport and buffering for a camera node streaming JPEG frames to
//! a hub over an unreliable link.
//!
//! This crate contains:
//! - **Frame**: `Frame` and the latest-wins `FrameSink`
//! - **Command**: `START`/`STOP` verbs, `CommandState`, `CommandChannel`, and the line codec
//! - **Transport**: the `FrameTransport` seam with a length-prefixed TCP
//!   implementation and a chunked UDP implementation with reassembly
//! - **Supervisor**: `ConnectionSupervisor`, the single owner of a session, with backoff
//! - **Capture**: the node-side `CaptureLoop` over a `CaptureSource`
//! - **Hub**: the hub-side `ServerSession` and its `HubHandle`
//! - **Error**: `LinkError` and its `ErrorClass`

pub mod capture;
pub mod command;
pub mod error;
pub mod frame;
pub mod hub;
pub mod jpeg;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{CaptureConfig, CaptureLoop, CaptureSource, CaptureStats};
pub use command::{CommandChannel, CommandCodec, CommandState, CommandVerb, MAX_COMMAND_LINE};
pub use error::{ErrorClass, LinkError};
pub use frame::{Frame, FrameSink};
pub use hub::{HubConfig, HubHandle, HubStatus, ServerSession};
pub use supervisor::{
    Backoff, ConnectionPhase, ConnectionSupervisor, Session, SupervisorConfig,
};
pub use transport::{
    ChunkHeader, Connector, DatagramPacket, DatagramTransport, Decoded, FrameCodec,
    FrameTransport, Reassembler, ReassemblyStats, StreamTransport, TcpAcceptor, TcpConnector,
    TransportKind, TransportOptions, UdpConnector,
};
