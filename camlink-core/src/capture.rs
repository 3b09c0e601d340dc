//! Node-side capture loop.
//!
//! One cooperative task alternates between the command channel and the
//! camera:
//!
//! 1. Poll for a verb (briefly while streaming, longer while idle).
//! 2. If streaming: capture, read the encoded frame, send it.
//! 3. Sleep whatever is left of the frame interval. A slow iteration is
//!    followed immediately by the next one, with no catch-up burst.
//!
//! The command check happens once per produced frame, so a STOP takes
//! effect within one frame interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::command::CommandChannel;
use crate::error::LinkError;
use crate::supervisor::{ConnectionSupervisor, Session};
use crate::transport::{Connector, FrameTransport};

// ── CaptureSource ────────────────────────────────────────────────

/// The camera driver, as the capture loop sees it.
#[async_trait]
pub trait CaptureSource: Send {
    /// Trigger exposure and encoding of one frame.
    async fn capture(&mut self);

    /// The encoded frame from the last capture.
    ///
    /// Returns empty bytes when nothing is available, the read failed, or
    /// the frame is larger than `max_size`.
    async fn read_encoded_frame(&mut self, max_size: Option<usize>) -> Bytes;
}

// ── CaptureConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Target frames per second.
    pub target_fps: u8,
    /// Upper bound on one capture + read.
    pub capture_timeout: Duration,
    /// Command poll while streaming.
    pub command_poll: Duration,
    /// Command poll while idle.
    pub idle_poll: Duration,
    /// Largest frame worth sending; `None` accepts any size.
    pub max_frame_bytes: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 8,
            capture_timeout: Duration::from_secs(2),
            command_poll: Duration::from_millis(1),
            idle_poll: Duration::from_millis(200),
            max_frame_bytes: Some(120 * 1024),
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / u32::from(self.target_fps.max(1))
    }
}

// ── CaptureStats ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Iterations that produced nothing to send.
    pub captures_skipped: u64,
    /// Frames the transport refused without ending the session.
    pub frames_dropped: u64,
    pub commands_received: u64,
}

// ── CaptureLoop ──────────────────────────────────────────────────

/// Drives a [`CaptureSource`] according to the [`CommandChannel`].
pub struct CaptureLoop<S> {
    source: S,
    commands: CommandChannel,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    stats: CaptureStats,
}

impl<S: CaptureSource> CaptureLoop<S> {
    pub fn new(source: S, commands: CommandChannel, config: CaptureConfig) -> Self {
        Self {
            source,
            commands,
            config,
            running: Arc::new(AtomicBool::new(true)),
            stats: CaptureStats::default(),
        }
    }

    /// Shared flag; clearing it ends [`run_session`](Self::run_session).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// Stream across sessions until stopped, reconnecting through
    /// `supervisor` after each failure.
    ///
    /// Build the supervisor with [`stop_handle`](Self::stop_handle) so one
    /// flag stops both.
    pub async fn run<C: Connector>(&mut self, supervisor: &mut ConnectionSupervisor<C>) {
        while let Some(session) = supervisor.connect().await {
            info!("session {} with {}: waiting for START", session.id(), session.peer());
            match self.run_session(session).await {
                Ok(()) => break,
                Err(e) => supervisor.disconnect(&e),
            }
        }
        supervisor.shutdown();
        info!(
            "capture stopped after {} frames ({} bytes)",
            self.stats.frames_sent, self.stats.bytes_sent
        );
    }

    /// Run on one session until stopped or the session fails.
    ///
    /// Streaming is disarmed when this returns; the hub must send START
    /// again on the next session.
    pub async fn run_session<T: FrameTransport>(&mut self, session: &mut Session<T>) -> Result<(), LinkError> {
        let mut result = Ok(());
        while self.is_running() {
            match self.step(session.transport_mut()).await {
                Ok(true) => session.record_activity(),
                Ok(false) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if self.commands.state().is_streaming() {
            info!("session over; streaming disarmed");
        }
        self.commands.reset();
        result
    }

    /// One iteration: command poll, then capture/send/pace if streaming.
    ///
    /// Returns `true` if the hub sent a verb or accepted a frame. Only
    /// session failures are returned as errors.
    pub async fn step<T>(&mut self, transport: &mut T) -> Result<bool, LinkError>
    where
        T: FrameTransport + ?Sized,
    {
        let started = Instant::now();
        let mut active = false;
        let wait = if self.commands.state().is_streaming() {
            self.config.command_poll
        } else {
            self.config.idle_poll
        };
        match transport.poll_command(wait).await {
            Ok(Some(verb)) => {
                active = true;
                self.stats.commands_received += 1;
                if self.commands.deliver(verb) {
                    info!("{verb} received; {}", self.commands.state());
                }
            }
            Ok(None) => {}
            Err(e) if e.is_session_failure() => return Err(e),
            Err(e) => debug!("command poll: {e}"),
        }

        if !self.commands.state().is_streaming() {
            return Ok(active);
        }

        if let Some(frame) = self.capture_one().await {
            match transport.send_frame(&frame).await {
                Ok(()) => {
                    active = true;
                    self.stats.frames_sent += 1;
                    self.stats.bytes_sent += frame.len() as u64;
                    trace!("sent frame of {} bytes", frame.len());
                }
                Err(e) if e.is_session_failure() => return Err(e),
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    debug!("frame dropped: {e}");
                }
            }
        }

        pace(started, self.config.frame_interval()).await;
        Ok(active)
    }

    /// Capture and read one frame, or `None` if there is nothing to send.
    async fn capture_one(&mut self) -> Option<Bytes> {
        let max = self.config.max_frame_bytes;
        let source = &mut self.source;
        let read = async {
            source.capture().await;
            source.read_encoded_frame(max).await
        };

        let frame = match tokio::time::timeout(self.config.capture_timeout, read).await {
            Ok(frame) => frame,
            Err(_) => {
                warn!("capture timed out after {:?}", self.config.capture_timeout);
                self.stats.captures_skipped += 1;
                return None;
            }
        };
        if frame.is_empty() || max.is_some_and(|max| frame.len() > max) {
            trace!("no usable frame ({} bytes)", frame.len());
            self.stats.captures_skipped += 1;
            return None;
        }
        Some(frame)
    }
}

/// Sleep out the rest of `interval` measured from `started`.
async fn pace(started: Instant, interval: Duration) {
    let elapsed = started.elapsed();
    if elapsed < interval {
        tokio::time::sleep(interval - elapsed).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandState, CommandVerb};
    use crate::supervisor::SupervisorConfig;
    use crate::testing::{MockConnector, MockTransport};

    struct FakeSource {
        frames: Vec<Bytes>,
        next: usize,
        delay: Duration,
        captures: usize,
    }

    impl FakeSource {
        fn new(frames: &[&'static [u8]]) -> Self {
            Self {
                frames: frames.iter().map(|&f| Bytes::from_static(f)).collect(),
                next: 0,
                delay: Duration::ZERO,
                captures: 0,
            }
        }
    }

    #[async_trait]
    impl CaptureSource for FakeSource {
        async fn capture(&mut self) {
            self.captures += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        async fn read_encoded_frame(&mut self, max_size: Option<usize>) -> Bytes {
            let frame = self.frames[self.next % self.frames.len()].clone();
            self.next += 1;
            if max_size.is_some_and(|max| frame.len() > max) {
                return Bytes::new();
            }
            frame
        }
    }

    fn capture_loop(source: FakeSource) -> CaptureLoop<FakeSource> {
        CaptureLoop::new(source, CommandChannel::new(), CaptureConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sends_nothing() {
        let mut cl = capture_loop(FakeSource::new(&[b"\xFF\xD8a\xFF\xD9"]));
        let mut transport = MockTransport::new();
        for _ in 0..5 {
            cl.step(&mut transport).await.unwrap();
        }
        assert!(transport.sent.frames().is_empty());
        assert_eq!(cl.source.captures, 0);
        assert_eq!(cl.commands().state(), CommandState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn start_streams_until_stop() {
        let mut cl = capture_loop(FakeSource::new(&[b"one", b"two"]));
        let mut transport = MockTransport::new().with_commands([
            Ok(Some(CommandVerb::Start)),
            Ok(None),
            Ok(Some(CommandVerb::Start)),
            Ok(Some(CommandVerb::Stop)),
            Ok(None),
        ]);
        for _ in 0..5 {
            cl.step(&mut transport).await.unwrap();
        }
        let sent: Vec<Bytes> = transport.sent.frames();
        assert_eq!(sent, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"one")]);
        assert_eq!(cl.stats().frames_sent, 3);
        assert_eq!(cl.stats().commands_received, 3);
        assert_eq!(cl.commands().state(), CommandState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_to_target_rate() {
        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        cl.commands().deliver(CommandVerb::Start);
        let mut transport = MockTransport::new();

        let start = Instant::now();
        for _ in 0..8 {
            cl.step(&mut transport).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1020));
        assert_eq!(transport.sent.frames().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_capture_gets_no_catch_up() {
        let mut source = FakeSource::new(&[b"frame"]);
        source.delay = Duration::from_millis(300);
        let mut cl = capture_loop(source);
        cl.commands().deliver(CommandVerb::Start);
        let mut transport = MockTransport::new();

        let start = Instant::now();
        for _ in 0..3 {
            cl.step(&mut transport).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_millis(950));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_oversize_captures_are_skipped() {
        static BIG: [u8; 200 * 1024] = [0xAB; 200 * 1024];
        let mut cl = capture_loop(FakeSource::new(&[b"", &BIG, b"ok"]));
        cl.commands().deliver(CommandVerb::Start);
        let mut transport = MockTransport::new();
        for _ in 0..3 {
            cl.step(&mut transport).await.unwrap();
        }
        assert_eq!(transport.sent.frames(), vec![Bytes::from_static(b"ok")]);
        assert_eq!(cl.stats().captures_skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_capture_does_not_stall_commands() {
        let mut source = FakeSource::new(&[b"frame"]);
        source.delay = Duration::from_secs(3600);
        let mut cl = capture_loop(source);
        cl.commands().deliver(CommandVerb::Start);
        let mut transport = MockTransport::new().with_commands([Ok(None), Ok(Some(CommandVerb::Stop))]);

        let start = Instant::now();
        cl.step(&mut transport).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        cl.step(&mut transport).await.unwrap();
        assert_eq!(cl.commands().state(), CommandState::Idle);
        assert!(transport.sent.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_failure_ends_run_and_disarms() {
        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        let mut transport = MockTransport::new().with_commands([Ok(Some(CommandVerb::Start))]);
        transport.close_after_frames = Some(2);
        let sent = transport.sent.clone();
        let mut session = Session::new(1, transport);

        let result = cl.run_session(&mut session).await;
        assert!(matches!(result, Err(LinkError::Closed)));
        assert_eq!(sent.frames().len(), 2);
        assert_eq!(cl.commands().state(), CommandState::Idle);
        // The second frame went out one interval after the first.
        assert!(session.last_activity() - session.established_at() >= Duration::from_millis(125));
    }

    #[tokio::test(start_paused = true)]
    async fn step_reports_hub_activity() {
        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        let mut transport = MockTransport::new().with_commands([Ok(None), Ok(Some(CommandVerb::Start))]);
        assert!(!cl.step(&mut transport).await.unwrap());
        assert!(cl.step(&mut transport).await.unwrap());
        assert!(cl.step(&mut transport).await.unwrap());
        assert_eq!(transport.sent.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_records_no_activity() {
        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        let stop = cl.stop_handle();
        let mut session = Session::new(1, MockTransport::new());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stop.store(false, Ordering::SeqCst);
        });
        assert!(cl.run_session(&mut session).await.is_ok());
        assert_eq!(session.last_activity(), session.established_at());
        assert!(session.idle_for() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_ends_run() {
        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        let stop = cl.stop_handle();
        let mut session = Session::new(1, MockTransport::new());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.store(false, Ordering::SeqCst);
        });
        assert!(cl.run_session(&mut session).await.is_ok());
        assert!(!cl.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconnects_and_requires_rearm() {
        let mut first = MockTransport::new().with_commands([Ok(Some(CommandVerb::Start))]);
        first.close_after_frames = Some(3);
        let second = MockTransport::new();
        let second_sent = second.sent.clone();
        let connector = MockConnector::new([Ok(first), Ok(second)]);
        let connects = connector.connects.clone();

        let mut cl = capture_loop(FakeSource::new(&[b"frame"]));
        let mut sup = ConnectionSupervisor::new(connector, SupervisorConfig::default(), cl.stop_handle());
        let stop = cl.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stop.store(false, Ordering::SeqCst);
        });

        cl.run(&mut sup).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(cl.stats().frames_sent, 3);
        // The second session never received START, so nothing was sent.
        assert!(second_sent.frames().is_empty());
        assert!(sup.phase().is_disconnected());
    }

    #[test]
    fn frame_interval_from_fps() {
        let config = CaptureConfig::default();
        assert_eq!(config.frame_interval(), Duration::from_millis(125));
        let zero = CaptureConfig {
            target_fps: 0,
            ..CaptureConfig::default()
        };
        assert_eq!(zero.frame_interval(), Duration::from_secs(1));
    }
}
