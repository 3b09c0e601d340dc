//! Scripted transports for unit tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::command::CommandVerb;
use crate::error::LinkError;
use crate::transport::{Connector, Decoded, FrameTransport, TransportKind};

/// Everything a [`MockTransport`] was asked to send.
#[derive(Debug, Default, Clone)]
pub struct Sent {
    pub frames: Arc<Mutex<Vec<Bytes>>>,
    pub commands: Arc<Mutex<Vec<CommandVerb>>>,
}

impl Sent {
    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<CommandVerb> {
        self.commands.lock().unwrap().clone()
    }
}

/// Replays queued results. An empty queue behaves like an idle peer: the
/// call waits its timeout and reports nothing.
pub struct MockTransport {
    pub incoming: VecDeque<Result<Decoded, LinkError>>,
    pub commands: VecDeque<Result<Option<CommandVerb>, LinkError>>,
    /// Fail `send_frame` with `Closed` once this many frames were sent.
    pub close_after_frames: Option<usize>,
    /// Report `Closed` from `decode_next` once any command was sent.
    pub close_once_commanded: bool,
    /// Wait before handing out each queued `decode_next` result.
    pub decode_delay: Duration,
    pub sent: Sent,
    pub peer: SocketAddr,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            commands: VecDeque::new(),
            close_after_frames: None,
            close_once_commanded: false,
            decode_delay: Duration::ZERO,
            sent: Sent::default(),
            peer: "127.0.0.1:4444".parse().unwrap(),
        }
    }

    pub fn with_incoming(mut self, items: impl IntoIterator<Item = Result<Decoded, LinkError>>) -> Self {
        self.incoming.extend(items);
        self
    }

    pub fn with_commands(
        mut self,
        items: impl IntoIterator<Item = Result<Option<CommandVerb>, LinkError>>,
    ) -> Self {
        self.commands.extend(items);
        self
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let mut frames = self.sent.frames.lock().unwrap();
        if self.close_after_frames.is_some_and(|n| frames.len() >= n) {
            return Err(LinkError::Closed);
        }
        frames.push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    async fn decode_next(&mut self) -> Result<Decoded, LinkError> {
        if self.close_once_commanded && !self.sent.commands.lock().unwrap().is_empty() {
            return Err(LinkError::Closed);
        }
        if !self.decode_delay.is_zero() && !self.incoming.is_empty() {
            tokio::time::sleep(self.decode_delay).await;
        }
        match self.incoming.pop_front() {
            Some(item) => item,
            None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Decoded::Incomplete)
            }
        }
    }

    async fn send_command(&mut self, verb: CommandVerb) -> Result<(), LinkError> {
        self.sent.commands.lock().unwrap().push(verb);
        Ok(())
    }

    async fn poll_command(&mut self, wait: Duration) -> Result<Option<CommandVerb>, LinkError> {
        match self.commands.pop_front() {
            Some(item) => item,
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}

/// Hands out queued connect results in order. Once the queue is empty every
/// attempt fails with `Closed`.
pub struct MockConnector {
    pub attempts: VecDeque<Result<MockTransport, LinkError>>,
    pub superseded: VecDeque<bool>,
    pub connects: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(attempts: impl IntoIterator<Item = Result<MockTransport, LinkError>>) -> Self {
        Self {
            attempts: attempts.into_iter().collect(),
            superseded: VecDeque::new(),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self) -> Result<MockTransport, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.attempts.pop_front().unwrap_or(Err(LinkError::Closed))
    }

    async fn superseded(&mut self) -> bool {
        self.superseded.pop_front().unwrap_or(false)
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
