//! Length-prefixed frame transport over an ordered byte stream.
//!
//! ## Wire format
//!
//! ```text
//! length:  u32 big-endian  (4)
//! payload: [u8]            (length bytes of JPEG)
//! ```
//!
//! Control verbs travel the other way on the same stream as `\n`-terminated
//! ASCII lines (see [`CommandCodec`]).
//!
//! The read buffer survives timeouts, so a read that times out halfway
//! through a frame loses nothing: the next [`decode_next`] resumes with the
//! bytes already received. A frame is only ever produced once all of its
//! declared bytes are present.
//!
//! [`decode_next`]: FrameTransport::decode_next

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::command::{CommandCodec, CommandVerb};
use crate::error::LinkError;
use crate::transport::{Connector, Decoded, FrameTransport, TransportKind, TransportOptions};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Minimum spare capacity reserved before each socket read.
const READ_CHUNK: usize = 8 * 1024;

// ── FrameCodec ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 4-byte length.
    Head,
    /// Waiting for `n` payload bytes.
    Body(usize),
    /// Discarding `n` bytes of an oversize frame.
    Skip(usize),
}

/// `tokio_util` codec for length-prefixed frames.
///
/// Zero-length frames and frames longer than the optional maximum are
/// dropped without failing the stream: the oversize payload is skipped
/// byte-for-byte so the next length prefix is found where the peer put it.
#[derive(Debug)]
pub struct FrameCodec {
    max_len: Option<usize>,
    state: DecodeState,
    dropped: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// A codec without a length guard.
    pub fn new() -> Self {
        Self {
            max_len: None,
            state: DecodeState::Head,
            dropped: 0,
        }
    }

    /// A codec that drops frames longer than `max_len`.
    pub fn with_max_len(max_len: Option<usize>) -> Self {
        Self {
            max_len,
            ..Self::new()
        }
    }

    /// Frames dropped for being empty or oversize.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len == 0 {
                        debug!("dropping zero-length frame");
                        self.dropped += 1;
                        continue;
                    }
                    if let Some(max) = self.max_len.filter(|&max| len > max) {
                        warn!("frame length {len} exceeds limit {max}; skipping");
                        self.dropped += 1;
                        self.state = DecodeState::Skip(len);
                        continue;
                    }
                    src.reserve(len.saturating_sub(src.len()));
                    self.state = DecodeState::Body(len);
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                    return Ok(Some(src.split_to(len).freeze()));
                }
                DecodeState::Skip(remaining) => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = DecodeState::Skip(remaining - n);
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                }
            }
        }
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.len()).map_err(|_| LinkError::FrameTooLarge {
            size: item.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(len);
        dst.put_slice(item);
        Ok(())
    }
}

/// Prefix `payload` with its big-endian `u32` length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, LinkError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(payload, &mut buf)?;
    Ok(buf.freeze())
}

// ── StreamTransport ──────────────────────────────────────────────

/// [`FrameTransport`] over any ordered byte stream, normally a TCP socket.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    read_buf: BytesMut,
    write_buf: BytesMut,
    frames: FrameCodec,
    commands: CommandCodec,
    peer: SocketAddr,
    options: TransportOptions,
}

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream, options: TransportOptions) -> Result<Self, LinkError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, peer, options))
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, peer: SocketAddr, options: TransportOptions) -> Self {
        Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            frames: FrameCodec::with_max_len(options.max_frame_len),
            commands: CommandCodec::new(),
            peer,
            options,
        }
    }

    /// Frames dropped by the decoder.
    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    /// Read more bytes into the buffer. `Ok(false)` means the wait elapsed.
    async fn fill(&mut self, wait: Duration) -> Result<bool, LinkError> {
        self.read_buf.reserve(READ_CHUNK);
        match tokio::time::timeout(wait, self.reader.read_buf(&mut self.read_buf)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(LinkError::Closed),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                let e = LinkError::from(e);
                if e.is_transient() { Ok(false) } else { Err(e) }
            }
        }
    }

    /// Write out and clear `write_buf`.
    async fn flush_out(&mut self) -> Result<(), LinkError> {
        let deadline = self.options.write_timeout;
        let write = async {
            self.writer.write_all(&self.write_buf).await?;
            self.writer.flush().await
        };
        let result = tokio::time::timeout(deadline, write).await;
        self.write_buf.clear();
        match result {
            Err(_) => Err(LinkError::WriteStalled(deadline)),
            Ok(r) => r.map_err(LinkError::from),
        }
    }
}

#[async_trait]
impl<R, W> FrameTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        self.frames.encode(payload, &mut self.write_buf)?;
        self.flush_out().await
    }

    async fn decode_next(&mut self) -> Result<Decoded, LinkError> {
        loop {
            if let Some(payload) = self.frames.decode(&mut self.read_buf)? {
                return Ok(Decoded::Frame(payload));
            }
            if !self.fill(self.options.read_timeout).await? {
                return Ok(Decoded::Incomplete);
            }
        }
    }

    async fn send_command(&mut self, verb: CommandVerb) -> Result<(), LinkError> {
        self.commands.encode(verb, &mut self.write_buf)?;
        self.flush_out().await
    }

    async fn poll_command(&mut self, wait: Duration) -> Result<Option<CommandVerb>, LinkError> {
        loop {
            if let Some(verb) = self.commands.decode(&mut self.read_buf)? {
                return Ok(Some(verb));
            }
            if !self.fill(wait).await? {
                return Ok(None);
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn dropped_units(&self) -> u64 {
        self.frames.dropped() + self.commands.discarded()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}

// ── TcpConnector ─────────────────────────────────────────────────

/// Dials the hub. Used by the camera node.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    options: TransportOptions,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, options: TransportOptions) -> Self {
        Self {
            addr: addr.into(),
            options,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

    async fn connect(&mut self) -> Result<Self::Transport, LinkError> {
        let deadline = self.options.connect_timeout;
        let stream = tokio::time::timeout(deadline, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| LinkError::Timeout(deadline))??;
        StreamTransport::from_tcp(stream, self.options.clone())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// ── TcpAcceptor ──────────────────────────────────────────────────

/// Accepts one camera node at a time. Used by the hub.
///
/// While a session is live, a newly connecting node is parked and reported
/// through [`Connector::superseded`]; the supervisor then replaces the old
/// (likely half-open) session with it.
pub struct TcpAcceptor {
    listener: TcpListener,
    options: TransportOptions,
    pending: Option<(TcpStream, SocketAddr)>,
}

impl TcpAcceptor {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, options: TransportOptions) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening for camera nodes on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            options,
            pending: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Connector for TcpAcceptor {
    type Transport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

    async fn connect(&mut self) -> Result<Self::Transport, LinkError> {
        let stream = match self.pending.take() {
            Some((stream, _)) => stream,
            None => {
                let deadline = self.options.connect_timeout;
                let (stream, _) = tokio::time::timeout(deadline, self.listener.accept())
                    .await
                    .map_err(|_| LinkError::Timeout(deadline))??;
                stream
            }
        };
        StreamTransport::from_tcp(stream, self.options.clone())
    }

    async fn superseded(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("camera node {peer} is waiting to connect");
                self.pending = Some((stream, peer));
                true
            }
            Ok(Err(e)) => {
                warn!("accept error while checking for newer peer: {e}");
                false
            }
            Err(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp listen {addr}"),
            Err(_) => "tcp listen".to_string(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
