//! Control verbs and the streaming on/off state they drive.
//!
//! Two verbs exist, `START` and `STOP`, matched case-insensitively. On the
//! stream transport each verb is a `\n`-terminated ASCII line
//! ([`CommandCodec`]); on the datagram transport each verb is one short
//! datagram ([`CommandVerb::parse`]).

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::sync::watch;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::error::LinkError;

/// Longest control line accepted before the buffer is discarded.
pub const MAX_COMMAND_LINE: usize = 32;

// ── CommandVerb ──────────────────────────────────────────────────

/// A control verb sent from the hub to the camera node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandVerb {
    Start,
    Stop,
}

impl CommandVerb {
    /// Wire spelling, without terminator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
        }
    }

    /// Parse a verb, ignoring ASCII case and surrounding whitespace.
    pub fn parse(raw: &[u8]) -> Result<Self, LinkError> {
        let trimmed = raw.trim_ascii();
        if trimmed.eq_ignore_ascii_case(b"START") {
            Ok(Self::Start)
        } else if trimmed.eq_ignore_ascii_case(b"STOP") {
            Ok(Self::Stop)
        } else {
            Err(LinkError::InvalidCommand(
                String::from_utf8_lossy(trimmed).into_owned(),
            ))
        }
    }

    /// The state this verb transitions to.
    pub const fn target_state(self) -> CommandState {
        match self {
            Self::Start => CommandState::Streaming,
            Self::Stop => CommandState::Idle,
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandVerb {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

// ── CommandState ─────────────────────────────────────────────────

/// Whether the capture loop is producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    Idle,
    Streaming,
}

impl CommandState {
    pub fn is_streaming(self) -> bool {
        self == Self::Streaming
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Streaming => f.write_str("Streaming"),
        }
    }
}

// ── CommandChannel ───────────────────────────────────────────────

/// The sole authority for [`CommandState`].
///
/// Delivered verbs mutate the state; the capture loop reads it. Clones share
/// the same state. Delivery is idempotent.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    state: Arc<watch::Sender<CommandState>>,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CommandState::Idle);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Apply a verb. Returns `true` when the state actually changed.
    pub fn deliver(&self, verb: CommandVerb) -> bool {
        let target = verb.target_state();
        let changed = self.state.send_if_modified(|state| {
            if *state == target {
                false
            } else {
                *state = target;
                true
            }
        });
        if changed {
            debug!("{verb} received -> {target}");
        }
        changed
    }

    /// Force the state back to `Idle` (session teardown).
    pub fn reset(&self) {
        self.deliver(CommandVerb::Stop);
    }

    pub fn state(&self) -> CommandState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CommandState> {
        self.state.subscribe()
    }
}

// ── CommandCodec ─────────────────────────────────────────────────

/// Newline-delimited verb codec for the stream transport.
///
/// Unknown verbs and overlong lines are dropped with a warning; they never
/// surface as decode errors.
#[derive(Debug, Default)]
pub struct CommandCodec {
    discarded: u64,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines dropped because they were unknown or too long.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Decoder for CommandCodec {
    type Item = CommandVerb;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_COMMAND_LINE {
                    warn!("control line exceeds {MAX_COMMAND_LINE} bytes; discarding");
                    self.discarded += 1;
                    src.clear();
                }
                return Ok(None);
            };

            let line = src.split_to(newline + 1);
            if line.trim_ascii().is_empty() {
                continue;
            }
            match CommandVerb::parse(&line) {
                Ok(verb) => return Ok(Some(verb)),
                Err(e) => {
                    warn!("ignoring control line: {e}");
                    self.discarded += 1;
                }
            }
        }
    }
}

impl Encoder<CommandVerb> for CommandCodec {
    type Error = LinkError;

    fn encode(&mut self, item: CommandVerb, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let verb = item.as_str();
        dst.reserve(verb.len() + 1);
        dst.put_slice(verb.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode a verb as a single control datagram.
pub fn command_datagram(verb: CommandVerb) -> &'static [u8] {
    verb.as_str().as_bytes()
}

/// True when `datagram` looks like a control verb rather than frame data.
pub(crate) fn looks_like_command(datagram: &[u8]) -> bool {
    datagram.len() <= MAX_COMMAND_LINE && datagram.first().is_some_and(u8::is_ascii_alphabetic)
}

// ── Tests ────────────────────────────────────────────────────────
