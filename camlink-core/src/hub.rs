//! Hub-side server session.
//!
//! [`ServerSession`] runs as one task: it keeps a session alive through the
//! [`ConnectionSupervisor`], publishes every completed frame into a
//! [`FrameSink`], and forwards operator commands to the node. Everything the
//! presentation layer needs goes through a cloneable [`HubHandle`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace};

use crate::command::{CommandChannel, CommandState, CommandVerb};
use crate::error::LinkError;
use crate::frame::{Frame, FrameSink};
use crate::supervisor::{ConnectionPhase, ConnectionSupervisor, SupervisorConfig};
use crate::transport::{Connector, Decoded, FrameTransport};

/// Operator commands waiting to be forwarded.
const REQUEST_QUEUE: usize = 16;

// ── HubConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Re-send START after a reconnect if the operator last asked for
    /// streaming.
    pub resume_streaming: bool,
}

// ── Counters ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HubCounters {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    dropped: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone)]
pub struct HubStatus {
    pub phase: ConnectionPhase,
    pub streaming: CommandState,
    pub frames_received: u64,
    pub bytes_received: u64,
    /// Frames and packets dropped as protocol violations, all sessions.
    pub dropped: u64,
    pub sessions: u64,
    pub last_frame_at: Option<SystemTime>,
}

impl fmt::Display for HubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {} | {} frames, {} bytes, {} dropped, {} sessions",
            self.phase,
            self.streaming,
            self.frames_received,
            self.bytes_received,
            self.dropped,
            self.sessions
        )?;
        if let Some(age) = self.last_frame_at.and_then(|t| t.elapsed().ok()) {
            write!(f, " | last frame {:.1}s ago", age.as_secs_f64())?;
        }
        Ok(())
    }
}

// ── HubHandle ────────────────────────────────────────────────────

struct CommandRequest {
    verb: CommandVerb,
    reply: oneshot::Sender<bool>,
}

/// What the presentation layer talks to.
#[derive(Clone)]
pub struct HubHandle {
    sink: FrameSink,
    requests: mpsc::Sender<CommandRequest>,
    phase: watch::Receiver<ConnectionPhase>,
    commands: CommandChannel,
    counters: Arc<HubCounters>,
    running: Arc<AtomicBool>,
}

impl HubHandle {
    /// The most recent complete frame, if any has arrived.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.sink.peek()
    }

    /// Receiver that wakes on every published frame.
    pub fn frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.sink.subscribe()
    }

    pub fn phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    /// Forward a verb to the node.
    ///
    /// Returns `false` without waiting when no session is connected, when
    /// the session drops before the verb is written, and when the write
    /// fails.
    pub async fn send_command(&self, verb: CommandVerb) -> bool {
        if !self.phase.borrow().is_connected() {
            debug!("{verb} not sent: no node connected");
            return false;
        }
        let (reply, rx) = oneshot::channel();
        if self.requests.send(CommandRequest { verb, reply }).await.is_err() {
            return false;
        }
        let mut phase = self.phase.clone();
        tokio::select! {
            biased;
            sent = rx => sent.unwrap_or(false),
            _ = phase.wait_for(|p| !p.is_connected()) => {
                debug!("{verb} not sent: session dropped");
                false
            }
        }
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            phase: self.phase.borrow().clone(),
            streaming: self.commands.state(),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sessions: self.counters.sessions.load(Ordering::Relaxed),
            last_frame_at: self.sink.peek().map(|f| f.captured_at()),
        }
    }

    /// Ask the server session to shut down.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

// ── ServerSession ────────────────────────────────────────────────

enum Event {
    Decoded(Result<Decoded, LinkError>),
    Request(CommandRequest),
}

/// The hub's receive loop.
pub struct ServerSession<C: Connector> {
    supervisor: ConnectionSupervisor<C>,
    sink: FrameSink,
    requests: mpsc::Receiver<CommandRequest>,
    /// Mirror of the node's command state as far as the hub knows it.
    commands: CommandChannel,
    counters: Arc<HubCounters>,
    config: HubConfig,
    running: Arc<AtomicBool>,
    current_session: u64,
    dropped_before: u64,
    /// Last verb the operator successfully sent.
    requested: Option<CommandVerb>,
}

impl<C: Connector> ServerSession<C> {
    pub fn new(connector: C, supervisor: SupervisorConfig, config: HubConfig) -> (Self, HubHandle) {
        let running = Arc::new(AtomicBool::new(true));
        let supervisor = ConnectionSupervisor::new(connector, supervisor, Arc::clone(&running));
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let sink = FrameSink::new();
        let commands = CommandChannel::new();
        let counters = Arc::new(HubCounters::default());

        let handle = HubHandle {
            sink: sink.clone(),
            requests: tx,
            phase: supervisor.phase_receiver(),
            commands: commands.clone(),
            counters: Arc::clone(&counters),
            running: Arc::clone(&running),
        };
        let session = Self {
            supervisor,
            sink,
            requests: rx,
            commands,
            counters,
            config,
            running,
            current_session: 0,
            dropped_before: 0,
            requested: None,
        };
        (session, handle)
    }

    /// Serve until [`HubHandle::stop`] is called.
    pub async fn run(mut self) {
        info!("hub waiting for camera node via {}", self.supervisor.describe());

        while self.running.load(Ordering::SeqCst) {
            // Requests that arrive while no node is connected are refused
            // rather than left for whichever session comes next.
            let connected = tokio::select! {
                biased;
                session = self.supervisor.connect() => session.map(|s| s.id()),
                Some(request) = self.requests.recv() => {
                    refuse(request);
                    continue;
                }
            };
            let Some(id) = connected else {
                break;
            };
            if id != self.current_session {
                self.begin_session(id).await;
                continue;
            }
            let Some(session) = self.supervisor.session_mut() else {
                continue;
            };

            let event = tokio::select! {
                result = session.transport_mut().decode_next() => Event::Decoded(result),
                Some(request) = self.requests.recv() => Event::Request(request),
            };
            match event {
                Event::Decoded(result) => self.on_decoded(result),
                Event::Request(request) if request.reply.is_closed() => {
                    debug!("{} dropped: caller gave up", request.verb);
                }
                Event::Request(request) => {
                    let sent = self.forward(request.verb).await;
                    let _ = request.reply.send(sent);
                }
            }

            self.supervisor.check_superseded().await;
            if self.supervisor.session_mut().is_none() {
                self.refuse_pending();
            }
        }

        self.requests.close();
        self.refuse_pending();
        self.supervisor.shutdown();
        info!("hub stopped");
    }

    fn refuse_pending(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            refuse(request);
        }
    }

    /// Reset per-session state; re-arm the node if configured to.
    async fn begin_session(&mut self, id: u64) {
        self.current_session = id;
        self.dropped_before = self.counters.dropped.load(Ordering::Relaxed);
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        self.commands.reset();

        if self.config.resume_streaming && self.requested == Some(CommandVerb::Start) {
            info!("resuming stream on session {id}");
            self.forward(CommandVerb::Start).await;
        }
    }

    fn on_decoded(&mut self, result: Result<Decoded, LinkError>) {
        let decoded = self.supervisor.observe(result);
        let Some(session) = self.supervisor.session_mut() else {
            return;
        };
        self.counters.dropped.store(
            self.dropped_before + session.transport_mut().dropped_units(),
            Ordering::Relaxed,
        );
        if let Some(Decoded::Frame(payload)) = decoded {
            session.record_activity();
            trace!("frame of {} bytes from {}", payload.len(), session.peer());
            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_received
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            self.sink.publish(Frame::now(payload));
        }
    }

    /// Write a verb to the live session and mirror it on success.
    async fn forward(&mut self, verb: CommandVerb) -> bool {
        let Some(session) = self.supervisor.session_mut() else {
            return false;
        };
        let result = session.transport_mut().send_command(verb).await;
        if self.supervisor.observe(result).is_none() {
            return false;
        }
        self.requested = Some(verb);
        self.commands.deliver(verb);
        info!("{verb} sent to node");
        true
    }
}

fn refuse(request: CommandRequest) {
    debug!("{} not sent: no node connected", request.verb);
    let _ = request.reply.send(false);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockTransport};
    use bytes::Bytes;
    use std::time::Duration;

    async fn until_connected(handle: &HubHandle) {
        let mut phase = handle.phase();
        tokio::time::timeout(Duration::from_secs(30), phase.wait_for(|p| p.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn frames_land_in_sink_latest_wins() {
        let transport = MockTransport::new().with_incoming([
            Ok(Decoded::Frame(Bytes::from_static(b"first"))),
            Ok(Decoded::Incomplete),
            Ok(Decoded::Frame(Bytes::from_static(b"second"))),
        ]);
        let (session, handle) =
            ServerSession::new(MockConnector::new([Ok(transport)]), SupervisorConfig::default(), HubConfig::default());
        let task = tokio::spawn(session.run());

        let mut frames = handle.frames();
        tokio::time::timeout(
            Duration::from_secs(5),
            frames.wait_for(|f| f.as_ref().is_some_and(|f| f.payload().as_ref() == b"second")),
        )
        .await
        .unwrap()
        .unwrap();

        let status = handle.status();
        assert_eq!(status.frames_received, 2);
        assert_eq!(status.bytes_received, 11);
        assert_eq!(status.sessions, 1);
        assert!(status.last_frame_at.is_some());

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_fails_fast_when_disconnected() {
        let (session, handle) = ServerSession::new(
            MockConnector::new([Err(LinkError::Closed)]),
            SupervisorConfig::default(),
            HubConfig::default(),
        );
        let task = tokio::spawn(session.run());

        assert!(!handle.send_command(CommandVerb::Start).await);
        assert_eq!(handle.status().streaming, CommandState::Idle);

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_reaches_node_and_mirrors_state() {
        let transport = MockTransport::new();
        let sent = transport.sent.clone();
        let (session, handle) =
            ServerSession::new(MockConnector::new([Ok(transport)]), SupervisorConfig::default(), HubConfig::default());
        let task = tokio::spawn(session.run());

        until_connected(&handle).await;
        assert!(handle.send_command(CommandVerb::Start).await);
        assert_eq!(handle.status().streaming, CommandState::Streaming);
        assert!(handle.send_command(CommandVerb::Stop).await);
        assert_eq!(handle.status().streaming, CommandState::Idle);
        assert_eq!(sent.commands(), vec![CommandVerb::Start, CommandVerb::Stop]);

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_command_answers_when_session_drops() {
        for _ in 0..20 {
            let mut first = MockTransport::new()
                .with_incoming([Ok(Decoded::Frame(Bytes::from_static(b"only"))), Err(LinkError::Closed)]);
            first.decode_delay = Duration::from_millis(2);
            let first_sent = first.sent.clone();
            let second = MockTransport::new();
            let second_sent = second.sent.clone();
            let (session, handle) = ServerSession::new(
                MockConnector::new([Ok(first), Ok(second)]),
                SupervisorConfig {
                    backoff: Duration::from_millis(20),
                    backoff_max: None,
                },
                HubConfig::default(),
            );
            let task = tokio::spawn(session.run());

            until_connected(&handle).await;
            let sent = tokio::time::timeout(Duration::from_secs(1), handle.send_command(CommandVerb::Start))
                .await
                .expect("send_command must answer");

            // Once the replacement session is up, a refused verb must not
            // have reached either node.
            tokio::time::timeout(Duration::from_secs(5), async {
                while handle.status().sessions < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let delivered = first_sent.commands().len() + second_sent.commands().len();
            assert_eq!(delivered, usize::from(sent));

            handle.stop();
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requests_queued_while_connecting_are_refused() {
        let (session, handle) = ServerSession::new(
            MockConnector::new([Err(LinkError::Closed), Ok(MockTransport::new())]),
            SupervisorConfig {
                backoff: Duration::from_secs(60),
                backoff_max: None,
            },
            HubConfig::default(),
        );
        // Queue a request directly, as if the phase check had raced a drop.
        let (reply, rx) = oneshot::channel();
        handle
            .requests
            .send(CommandRequest {
                verb: CommandVerb::Start,
                reply,
            })
            .await
            .unwrap();
        let task = tokio::spawn(session.run());

        // Answered during the first backoff, long before the node shows up.
        let answer = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
        assert!(!answer.unwrap());
        assert!(!handle.phase().borrow().is_connected());
        assert_eq!(handle.status().streaming, CommandState::Idle);

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_last_frame_and_resumes_streaming() {
        let mut first = MockTransport::new().with_incoming([Ok(Decoded::Frame(Bytes::from_static(b"kept")))]);
        first.close_once_commanded = true;
        let second = MockTransport::new();
        let resent = second.sent.clone();

        let (session, handle) = ServerSession::new(
            MockConnector::new([Ok(first), Ok(second)]),
            SupervisorConfig::default(),
            HubConfig {
                resume_streaming: true,
            },
        );
        let task = tokio::spawn(session.run());

        let mut frames = handle.frames();
        tokio::time::timeout(Duration::from_secs(5), frames.wait_for(|f| f.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.send_command(CommandVerb::Start).await);

        // The first session now reports a closed peer; the hub reconnects
        // after backoff and re-arms the new session.
        tokio::time::timeout(Duration::from_secs(30), async {
            while resent.commands().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(resent.commands(), vec![CommandVerb::Start]);
        let status = handle.status();
        assert_eq!(status.sessions, 2);
        assert_eq!(status.streaming, CommandState::Streaming);
        assert_eq!(handle.latest_frame().unwrap().payload().as_ref(), b"kept");

        handle.stop();
        task.await.unwrap();
    }

    #[test]
    fn status_display() {
        let status = HubStatus {
            phase: ConnectionPhase::Disconnected,
            streaming: CommandState::Idle,
            frames_received: 3,
            bytes_received: 42,
            dropped: 1,
            sessions: 2,
            last_frame_at: None,
        };
        let text = status.to_string();
        assert!(text.starts_with("Disconnected"));
        assert!(text.contains("3 frames"));
        assert!(text.contains("1 dropped"));
    }
}
