//! Camera node service.
//!
//! Wires a [`CaptureSource`] into a [`CaptureLoop`] and drives it through a
//! [`ConnectionSupervisor`] over the configured transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use camlink_core::{
    CaptureLoop, CaptureSource, CaptureStats, CommandChannel, CommandState, ConnectionSupervisor,
    Connector, TcpConnector, TransportKind, UdpConnector,
};

use crate::config::NodeConfig;

// ── NodeService ──────────────────────────────────────────────────

/// The top-level camera node.
pub struct NodeService<S> {
    config: NodeConfig,
    capture: CaptureLoop<S>,
}

impl<S: CaptureSource> NodeService<S> {
    pub fn new(config: NodeConfig, source: S) -> Self {
        let capture = CaptureLoop::new(source, CommandChannel::new(), config.to_capture_config());
        Self { config, capture }
    }

    /// Obtain a handle that can be used to stop the service from another
    /// task or a signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.capture.stop_handle()
    }

    pub fn stop(&self) {
        self.capture.stop_handle().store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    pub fn stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn command_state(&self) -> CommandState {
        self.capture.commands().state()
    }

    /// Run until stopped, reconnecting after every lost session.
    pub async fn run(&mut self) {
        let options = self.config.to_transport_options();
        let network = &self.config.network;
        match network.transport {
            TransportKind::Stream => {
                let connector = TcpConnector::new(network.hub_address.clone(), options);
                self.run_with(connector).await;
            }
            TransportKind::Datagram => {
                let connector = UdpConnector::new(
                    network.bind_address.clone(),
                    network.hub_address.clone(),
                    options,
                );
                self.run_with(connector).await;
            }
        }
    }

    async fn run_with<C: Connector>(&mut self, connector: C) {
        let mut supervisor = ConnectionSupervisor::new(
            connector,
            self.config.to_supervisor_config(),
            self.capture.stop_handle(),
        );
        info!("camera node streaming to {}", supervisor.describe());
        self.capture.run(&mut supervisor).await;
        info!("camera node stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
