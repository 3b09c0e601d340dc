//! Configuration for the camera node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camlink_core::{CaptureConfig, SupervisorConfig, TransportKind, TransportOptions};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Link to the hub.
    pub network: NetworkConfig,
    /// Frame production.
    pub capture: CaptureSettings,
    /// Reconnect behaviour.
    pub link: LinkConfig,
    /// UDP-only framing settings.
    pub datagram: DatagramConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `stream` (TCP, the node dials the hub) or `datagram` (UDP between
    /// two fixed addresses).
    pub transport: TransportKind,
    /// Hub address (`host:port`).
    pub hub_address: String,
    /// Local UDP address. Unused over TCP.
    pub bind_address: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on writing one frame. A stalled write ends the session.
    pub write_timeout_ms: u64,
}

/// Capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Directory of `.jpg` / `.jpeg` files replayed in name order.
    pub source_dir: PathBuf,
    /// Target frames per second.
    pub fps: u8,
    pub capture_timeout_ms: u64,
    /// Command poll while streaming.
    pub command_poll_ms: u64,
    /// Command poll while idle.
    pub idle_poll_ms: u64,
    /// Larger captures are skipped. `0` disables the limit.
    pub max_jpeg_bytes: usize,
}

/// Reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub backoff_ms: u64,
    /// Cap for the doubling backoff. `0` keeps the backoff fixed.
    pub backoff_max_ms: u64,
}

/// Datagram framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    /// Payload bytes per chunk.
    pub chunk_payload: usize,
    /// Send frames that fit one chunk as a single packet.
    pub single_packet_frames: bool,
    pub reassembly_timeout_ms: u64,
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
            hub_address: "127.0.0.1:4444".into(),
            bind_address: "0.0.0.0:4445".into(),
            connect_timeout_ms: 2000,
            write_timeout_ms: 2000,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("frames"),
            fps: 8,
            capture_timeout_ms: 2000,
            command_poll_ms: 1,
            idle_poll_ms: 200,
            max_jpeg_bytes: 120 * 1024,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
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

    pub fn to_capture_config(&self) -> CaptureConfig {
        let c = &self.capture;
        CaptureConfig {
            target_fps: c.fps.clamp(1, 60),
            capture_timeout: Duration::from_millis(c.capture_timeout_ms.max(1)),
            command_poll: Duration::from_millis(c.command_poll_ms),
            idle_poll: Duration::from_millis(c.idle_poll_ms.max(1)),
            max_frame_bytes: (c.max_jpeg_bytes > 0).then_some(c.max_jpeg_bytes),
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            backoff: Duration::from_millis(self.link.backoff_ms),
            backoff_max: (self.link.backoff_max_ms > 0)
                .then(|| Duration::from_millis(self.link.backoff_max_ms.max(self.link.backoff_ms))),
        }
    }

    pub fn to_transport_options(&self) -> TransportOptions {
        TransportOptions {
            write_timeout: Duration::from_millis(self.network.write_timeout_ms.max(1)),
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms.max(1)),
            chunk_payload: self.datagram.chunk_payload.clamp(64, 60_000),
            single_packet_frames: self.datagram.single_packet_frames,
            reassembly_timeout: Duration::from_millis(self.datagram.reassembly_timeout_ms.max(1)),
            ..TransportOptions::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        assert!(text.contains("hub_address"));
        assert!(text.contains("transport = \"stream\""));
        assert!(text.contains("fps"));
    }

    #[test]
    fn roundtrip_config() {
        let mut cfg = NodeConfig::default();
        cfg.network.transport = TransportKind::Datagram;
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.transport, TransportKind::Datagram);
        assert_eq!(parsed.network.hub_address, "127.0.0.1:4444");
        assert_eq!(parsed.capture.fps, 8);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: NodeConfig = toml::from_str("[capture]\nfps = 15\n").unwrap();
        assert_eq!(parsed.capture.fps, 15);
        assert_eq!(parsed.capture.max_jpeg_bytes, 120 * 1024);
        assert_eq!(parsed.link.backoff_ms, 1000);
    }

    #[test]
    fn to_capture_config_clamps() {
        let mut cfg = NodeConfig::default();
        cfg.capture.fps = 120;
        cfg.capture.max_jpeg_bytes = 0;
        let capture = cfg.to_capture_config();
        assert_eq!(capture.target_fps, 60);
        assert_eq!(capture.max_frame_bytes, None);
        assert_eq!(capture.idle_poll, Duration::from_millis(200));
    }

    #[test]
    fn backoff_max_zero_means_fixed() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.to_supervisor_config().backoff_max, None);
        cfg.link.backoff_max_ms = 500;
        // Never below the initial delay.
        assert_eq!(cfg.to_supervisor_config().backoff_max, Some(Duration::from_secs(1)));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = NodeConfig::load(Path::new("/nonexistent/camlink-node.toml"));
        assert_eq!(cfg.network.transport, TransportKind::Stream);
    }

    #[test]
    fn write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        NodeConfig::write_default(&path).unwrap();
        let cfg = NodeConfig::load(&path);
        assert_eq!(cfg.datagram.chunk_payload, 1400);
    }
}
