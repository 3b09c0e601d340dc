//! Domain-specific error types for the camlink transport.
//!
//! All fallible operations return `Result<T, LinkError>`. Nothing in this
//! crate is process-fatal: every error maps to an [`ErrorClass`] that tells
//! the caller whether to retry, drop the offending unit, or tear the session
//! down and reconnect.

use std::time::Duration;
use thiserror::Error;

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A bounded wait elapsed. Re-poll; never surfaced beyond a log line.
    Transient,
    /// One packet or frame was bad. Drop it and keep the session.
    Protocol,
    /// The session is unusable. Tear down and reconnect after backoff.
    Session,
}

/// The canonical error type for camlink.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Transient ────────────────────────────────────────────────
    /// A read, accept or connect did not complete within its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Session ──────────────────────────────────────────────────
    /// The peer closed the connection (zero-byte read).
    #[error("connection closed by peer")]
    Closed,

    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A write could not complete in time; the stream is now out of sync.
    #[error("write stalled for {0:?}")]
    WriteStalled(Duration),

    /// The peer address could not be resolved.
    #[error("cannot resolve address {0}")]
    Resolve(String),

    // ── Protocol ─────────────────────────────────────────────────
    /// A frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A datagram could not be parsed as a chunk or whole-frame packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A control line was not a known verb.
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    /// A state machine was asked for a transition it does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
}

impl LinkError {
    /// Classify this error according to the recovery it requires.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::Interrupted => ErrorClass::Transient,
                _ => ErrorClass::Session,
            },
            Self::Closed | Self::WriteStalled(_) | Self::Resolve(_) => ErrorClass::Session,
            Self::FrameTooLarge { .. }
            | Self::MalformedPacket(_)
            | Self::InvalidCommand(_)
            | Self::InvalidTransition(_) => ErrorClass::Protocol,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Shorthand for `class() == ErrorClass::Session`.
    pub fn is_session_failure(&self) -> bool {
        self.class() == ErrorClass::Session
    }
}
