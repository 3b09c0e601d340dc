//! Session ownership and reconnection.
//!
//! A [`ConnectionSupervisor`] holds at most one [`Session`] and is the only
//! thing allowed to drop it. Callers borrow the session for one unit of work,
//! then hand the result back through [`ConnectionSupervisor::observe`], which
//! decides from the [`ErrorClass`] whether to keep going, drop one unit, or
//! tear the session down and reconnect after backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{ErrorClass, LinkError};
use crate::transport::{Connector, FrameTransport};

/// How often a sleeping supervisor re-checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

// ── ConnectionPhase ──────────────────────────────────────────────

/// Lifecycle of the supervised connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲               │              │
///       └───────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No session. Initial state, and the state after any failure.
    #[default]
    Disconnected,

    /// A connect or accept is in progress.
    Connecting,

    /// A session is live.
    Connected { since: Instant, peer: SocketAddr },
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { peer, .. } => write!(f, "Connected ({peer})"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the current session has been up. `None` unless connected.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`, `Connecting` (re-poll after a timeout).
    pub fn begin_connect(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Disconnected | Self::Connecting => {
                *self = Self::Connecting;
                Ok(())
            }
            Self::Connected { .. } => Err(LinkError::InvalidTransition(
                "cannot connect: a session is already live",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn establish(&mut self, peer: SocketAddr) -> Result<(), LinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                    peer,
                };
                Ok(())
            }
            _ => Err(LinkError::InvalidTransition(
                "cannot establish: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn fail_connect(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(LinkError::InvalidTransition(
                "cannot fail connect: not in Connecting state",
            )),
        }
    }

    /// Reset to `Disconnected` regardless of the current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Backoff ──────────────────────────────────────────────────────

/// Delay before the next reconnect attempt.
///
/// Fixed when `max` is `None`; otherwise doubles per consecutive failure up
/// to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Option<Duration>,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Option<Duration>) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to use now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if let Some(max) = self.max {
            self.current = self.current.saturating_mul(2).min(max.max(self.initial));
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ── SupervisorConfig ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait before reconnecting after a failure.
    pub backoff: Duration,
    /// Cap for doubling backoff; `None` keeps it fixed.
    pub backoff_max: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            backoff_max: None,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One live exchange with a peer.
#[derive(Debug)]
pub struct Session<T> {
    id: u64,
    transport: T,
    peer: SocketAddr,
    established_at: tokio::time::Instant,
    last_activity: tokio::time::Instant,
}

impl<T: FrameTransport> Session<T> {
    pub(crate) fn new(id: u64, transport: T) -> Self {
        let now = tokio::time::Instant::now();
        Self {
            id,
            peer: transport.peer_addr(),
            transport,
            established_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn established_at(&self) -> tokio::time::Instant {
        self.established_at
    }

    pub fn last_activity(&self) -> tokio::time::Instant {
        self.last_activity
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Note that data arrived from or was accepted by the peer.
    pub fn record_activity(&mut self) {
        self.last_activity = tokio::time::Instant::now();
    }

    /// Time since the peer was last heard from or accepted data.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

// ── ConnectionSupervisor ─────────────────────────────────────────

/// Owns the connector, the phase, and the single live session.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    phase: watch::Sender<ConnectionPhase>,
    session: Option<Session<C::Transport>>,
    backoff: Backoff,
    retry_at: Option<tokio::time::Instant>,
    running: Arc<AtomicBool>,
    next_id: u64,
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// `running` is the owner's stop flag; clearing it ends [`connect`]
    /// waits.
    ///
    /// [`connect`]: Self::connect
    pub fn new(connector: C, config: SupervisorConfig, running: Arc<AtomicBool>) -> Self {
        let (phase, _rx) = watch::channel(ConnectionPhase::Disconnected);
        Self {
            connector,
            phase,
            session: None,
            backoff: Backoff::new(config.backoff, config.backoff_max),
            retry_at: None,
            running,
            next_id: 0,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.borrow().clone()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The connector's endpoint, for logs.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session<C::Transport>> {
        self.session.as_mut()
    }

    /// Return the live session, establishing one first if needed.
    ///
    /// Waits out any pending backoff. Returns `None` only once the stop flag
    /// is cleared.
    pub async fn connect(&mut self) -> Option<&mut Session<C::Transport>> {
        while self.session.is_none() {
            if !self.is_running() {
                return None;
            }
            // Cleared only after the sleep so a cancelled connect keeps its
            // backoff.
            if let Some(at) = self.retry_at {
                if !sleep_until_unless_stopped(at, &self.running).await {
                    return None;
                }
                self.retry_at = None;
            }

            self.transition(ConnectionPhase::begin_connect);
            match self.connector.connect().await {
                Ok(transport) => {
                    self.next_id += 1;
                    let session = Session::new(self.next_id, transport);
                    let peer = session.peer();
                    info!("session {} established with {peer}", session.id());
                    self.session = Some(session);
                    self.backoff.reset();
                    self.transition(|p| p.establish(peer));
                }
                Err(e) if e.is_transient() => {
                    trace!("{}: {e}; polling again", self.connector.describe());
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "connect via {} failed: {e}; retrying in {delay:?}",
                        self.connector.describe()
                    );
                    self.retry_at = Some(tokio::time::Instant::now() + delay);
                    self.transition(ConnectionPhase::fail_connect);
                }
            }
        }
        self.session.as_mut()
    }

    /// Classify the outcome of one unit of session work.
    ///
    /// `Ok` values pass through. Transient and protocol errors drop the
    /// unit and keep the session; session errors tear it down.
    pub fn observe<T>(&mut self, result: Result<T, LinkError>) -> Option<T> {
        let e = match result {
            Ok(value) => return Some(value),
            Err(e) => e,
        };
        match e.class() {
            ErrorClass::Transient => trace!("transient: {e}"),
            ErrorClass::Protocol => debug!("dropped one unit: {e}"),
            ErrorClass::Session => self.disconnect(&e),
        }
        None
    }

    /// Tear down the live session and schedule a reconnect after backoff.
    pub fn disconnect(&mut self, reason: &LinkError) {
        let Some(session) = self.session.take() else {
            return;
        };
        let delay = self.backoff.next_delay();
        warn!(
            "session {} with {} ended after {:?} (idle {:?}): {reason}; reconnecting in {delay:?}",
            session.id(),
            session.peer(),
            session.established_at().elapsed(),
            session.idle_for()
        );
        self.retry_at = Some(tokio::time::Instant::now() + delay);
        self.phase.send_modify(ConnectionPhase::force_disconnect);
    }

    /// Replace the live session if the connector has a newer peer waiting.
    /// The replacement is connected on the next [`connect`](Self::connect)
    /// without backoff.
    pub async fn check_superseded(&mut self) -> bool {
        if self.session.is_none() || !self.connector.superseded().await {
            return false;
        }
        if let Some(old) = self.session.take() {
            info!("session {} with {} superseded by a newer peer", old.id(), old.peer());
        }
        self.phase.send_modify(ConnectionPhase::force_disconnect);
        true
    }

    /// Stop: clear the flag and drop the session.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            info!("closing session {} with {}", session.id(), session.peer());
        }
        self.phase.send_modify(ConnectionPhase::force_disconnect);
    }

    fn transition(&self, step: impl FnOnce(&mut ConnectionPhase) -> Result<(), LinkError>) {
        let mut outcome = Ok(());
        self.phase.send_modify(|phase| outcome = step(phase));
        if let Err(e) = outcome {
            warn!("phase {}: {e}", *self.phase.borrow());
        }
    }
}

/// Resolves once `running` is cleared.
pub async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(STOP_POLL).await;
    }
}

/// Sleep until `deadline`. Returns `false` if stopped first.
pub async fn sleep_until_unless_stopped(deadline: tokio::time::Instant, running: &AtomicBool) -> bool {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => running.load(Ordering::SeqCst),
        _ = wait_for_stop(running) => false,
    }
}

// ── Tests ────────────────────────────────────────────────────────
