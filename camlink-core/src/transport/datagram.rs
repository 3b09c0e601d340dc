//! Chunked frame transport over UDP.
//!
//! Each frame is split into chunk datagrams (or one whole-frame datagram when
//! it fits) and sent to a fixed peer. The receiving side only accepts
//! datagrams whose source IP matches that peer, rebuilds frames with a
//! [`Reassembler`], and treats every lost packet as an incomplete frame
//! rather than an error. Control verbs travel as bare ASCII datagrams.
//!
//! There is no handshake: a session exists as soon as the socket is bound.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::command::{CommandVerb, command_datagram, looks_like_command};
use crate::error::LinkError;
use crate::transport::chunk::{DatagramPacket, split_frame};
use crate::transport::reassembly::{ReassemblyStats, Reassembler};
use crate::transport::{Connector, Decoded, FrameTransport, TransportKind, TransportOptions, resolve};

/// Large enough for any UDP payload.
const RECV_BUFFER: usize = 64 * 1024;

/// ICMP port-unreachable surfaces on some platforms as a refused or reset
/// error on the next socket call. The datagram is simply lost.
fn is_unreachable_peer(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

// ── DatagramTransport ────────────────────────────────────────────

/// [`FrameTransport`] over a UDP socket bound for one peer.
pub struct DatagramTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    reassembler: Reassembler,
    next_frame_id: u16,
    /// Verb that arrived while waiting for frames.
    pending_command: Option<CommandVerb>,
    recv_buf: Box<[u8]>,
    options: TransportOptions,
    foreign: u64,
    malformed: u64,
    oversize: u64,
}

impl DatagramTransport {
    pub fn new(socket: UdpSocket, peer: SocketAddr, options: TransportOptions) -> Self {
        Self {
            socket,
            peer,
            reassembler: Reassembler::new(options.reassembly_timeout, options.max_frame_len),
            next_frame_id: 0,
            pending_command: None,
            recv_buf: vec![0u8; RECV_BUFFER].into_boxed_slice(),
            options,
            foreign: 0,
            malformed: 0,
            oversize: 0,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.reassembler.stats()
    }

    /// Datagrams dropped because they could not be parsed.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Datagrams ignored because they came from another host.
    pub fn foreign(&self) -> u64 {
        self.foreign
    }

    /// Receive the next datagram from the peer's IP into `recv_buf`.
    /// `Ok(None)` means the deadline passed.
    async fn recv_from_peer(&mut self, deadline: Instant) -> Result<Option<usize>, LinkError> {
        loop {
            let recv = self.socket.recv_from(&mut self.recv_buf);
            let (len, from) = match tokio::time::timeout_at(deadline, recv).await {
                Err(_) => return Ok(None),
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_unreachable_peer(&e) => {
                    trace!("peer {} unreachable: {e}", self.peer);
                    continue;
                }
                Ok(Err(e)) => {
                    let e = LinkError::from(e);
                    if e.is_transient() {
                        continue;
                    }
                    return Err(e);
                }
            };
            if from.ip() != self.peer.ip() {
                trace!("ignoring {len} byte datagram from {from}");
                self.foreign += 1;
                continue;
            }
            return Ok(Some(len));
        }
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<bool, LinkError> {
        let deadline = self.options.write_timeout;
        match tokio::time::timeout(deadline, self.socket.send_to(packet, self.peer)).await {
            Err(_) => Err(LinkError::WriteStalled(deadline)),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if is_unreachable_peer(&e) => {
                debug!("peer {} unreachable: {e}", self.peer);
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FrameTransport for DatagramTransport {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let frame_id = self.next_frame_id;
        self.next_frame_id = frame_id.wrapping_add(1);

        let packets = split_frame(
            frame_id,
            payload,
            self.options.chunk_payload,
            self.options.single_packet_frames,
        )?;
        for packet in &packets {
            if !self.send_packet(packet).await? {
                debug!("frame {frame_id} lost");
                break;
            }
        }
        Ok(())
    }

    async fn decode_next(&mut self) -> Result<Decoded, LinkError> {
        let deadline = Instant::now() + self.options.read_timeout;
        loop {
            let Some(len) = self.recv_from_peer(deadline).await? else {
                return Ok(Decoded::Incomplete);
            };
            let datagram = &self.recv_buf[..len];
            match DatagramPacket::parse(datagram) {
                Ok(DatagramPacket::Whole(payload)) => {
                    if let Some(max) = self.options.max_frame_len.filter(|&max| payload.len() > max) {
                        warn!("frame of {} bytes exceeds limit {max}; dropping", payload.len());
                        self.oversize += 1;
                        continue;
                    }
                    return Ok(Decoded::Frame(Bytes::copy_from_slice(payload)));
                }
                Ok(DatagramPacket::Chunk { header, payload }) => {
                    let now = std::time::Instant::now();
                    if let Some(frame) = self.reassembler.accept(&header, payload, now) {
                        return Ok(Decoded::Frame(frame));
                    }
                }
                Err(e) => {
                    if looks_like_command(datagram) {
                        if let Ok(verb) = CommandVerb::parse(datagram) {
                            self.pending_command = Some(verb);
                            continue;
                        }
                    }
                    debug!("dropping datagram: {e}");
                    self.malformed += 1;
                }
            }
        }
    }

    async fn send_command(&mut self, verb: CommandVerb) -> Result<(), LinkError> {
        self.send_packet(command_datagram(verb)).await?;
        Ok(())
    }

    async fn poll_command(&mut self, wait: Duration) -> Result<Option<CommandVerb>, LinkError> {
        if let Some(verb) = self.pending_command.take() {
            return Ok(Some(verb));
        }
        let deadline = Instant::now() + wait;
        loop {
            let Some(len) = self.recv_from_peer(deadline).await? else {
                return Ok(None);
            };
            let datagram = &self.recv_buf[..len];
            if !looks_like_command(datagram) {
                trace!("ignoring {len} byte non-command datagram");
                continue;
            }
            match CommandVerb::parse(datagram) {
                Ok(verb) => return Ok(Some(verb)),
                Err(e) => {
                    warn!("ignoring control datagram: {e}");
                    self.malformed += 1;
                }
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn dropped_units(&self) -> u64 {
        let r = self.reassembler.stats();
        self.malformed + self.oversize + r.superseded + r.expired + r.oversize + r.malformed
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
}

// ── UdpConnector ─────────────────────────────────────────────────

/// Binds a local UDP socket and fixes the peer it talks to.
///
/// Both ends use this: the node binds its listen port and targets the hub,
/// the hub binds its port and targets the node.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    bind: String,
    peer: String,
    options: TransportOptions,
}

impl UdpConnector {
    pub fn new(bind: impl Into<String>, peer: impl Into<String>, options: TransportOptions) -> Self {
        Self {
            bind: bind.into(),
            peer: peer.into(),
            options,
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    type Transport = DatagramTransport;

    async fn connect(&mut self) -> Result<Self::Transport, LinkError> {
        let peer = resolve(&self.peer).await?;
        let socket = UdpSocket::bind(self.bind.as_str()).await?;
        info!("udp {} bound for peer {peer}", socket.local_addr()?);
        Ok(DatagramTransport::new(socket, peer, self.options.clone()))
    }

    fn describe(&self) -> String {
        format!("udp://{} <-> {}", self.bind, self.peer)
    }
}

// ── Tests ────────────────────────────────────────────────────────
