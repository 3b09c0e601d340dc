//! Configuration for the hub.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camlink_core::{HubConfig, SupervisorConfig, TransportKind, TransportOptions};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Where camera nodes reach the hub.
    pub network: NetworkConfig,
    /// Session behaviour.
    pub session: SessionConfig,
    /// UDP-only framing settings.
    pub datagram: DatagramConfig,
    /// Snapshot file output.
    pub snapshot: SnapshotConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `stream` (TCP, nodes dial in) or `datagram` (UDP with a fixed node
    /// address).
    pub transport: TransportKind,
    /// Local listen / bind address.
    pub listen_address: String,
    /// Node address for the datagram transport. Unused over TCP.
    pub node_address: String,
    pub accept_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Frames above this size are dropped. `0` disables the limit.
    pub max_frame_len: usize,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Re-send START after a reconnect if the operator last asked for it.
    pub resume_streaming: bool,
    pub backoff_ms: u64,
    /// Cap for the doubling backoff. `0` keeps the backoff fixed.
    pub backoff_max_ms: u64,
}

/// Datagram framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    pub chunk_payload: usize,
    pub single_packet_frames: bool,
    pub reassembly_timeout_ms: u64,
}

/// Snapshot output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// File rewritten with each new frame. Empty disables snapshots.
    pub path: PathBuf,
    /// Minimum spacing between two writes.
    pub min_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            listen_address: "0.0.0.0:4444".into(),
            node_address: "127.0.0.1:4445".into(),
            accept_timeout_ms: 2000,
            read_timeout_ms: 1000,
            write_timeout_ms: 2000,
            max_frame_len: 10_000_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resume_streaming: false,
            backoff_ms: 1000,
            backoff_max_ms: 0,
        }
    }
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            chunk_payload: 1400,
            single_packet_frames: true,
            reassembly_timeout_ms: 2000,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            min_interval_ms: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HubSettings {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            resume_streaming: self.session.resume_streaming,
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        let s = &self.session;
        SupervisorConfig {
            backoff: Duration::from_millis(s.backoff_ms),
            backoff_max: (s.backoff_max_ms > 0)
                .then(|| Duration::from_millis(s.backoff_max_ms.max(s.backoff_ms))),
        }
    }

    pub fn to_transport_options(&self) -> TransportOptions {
        let n = &self.network;
        TransportOptions {
            read_timeout: Duration::from_millis(n.read_timeout_ms.max(1)),
            write_timeout: Duration::from_millis(n.write_timeout_ms.max(1)),
            connect_timeout: Duration::from_millis(n.accept_timeout_ms.max(1)),
            max_frame_len: (n.max_frame_len > 0).then_some(n.max_frame_len),
            chunk_payload: self.datagram.chunk_payload.clamp(64, 60_000),
            single_packet_frames: self.datagram.single_packet_frames,
            reassembly_timeout: Duration::from_millis(self.datagram.reassembly_timeout_ms.max(1)),
        }
    }

    /// Snapshot target, if enabled.
    pub fn snapshot_path(&self) -> Option<&Path> {
        let path = self.snapshot.path.as_path();
        (!path.as_os_str().is_empty()).then_some(path)
    }
}

// ── Tests ────────────────────────────────────────────────────────
