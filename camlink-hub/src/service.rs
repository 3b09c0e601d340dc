//! Hub service.
//!
//! Binds the configured transport, runs the [`ServerSession`] on its own
//! task and, when enabled, the snapshot writer beside it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use camlink_core::{HubHandle, LinkError, ServerSession, TcpAcceptor, TransportKind, UdpConnector};

use crate::config::HubSettings;
use crate::snapshot::SnapshotWriter;

// ── HubService ───────────────────────────────────────────────────

/// A running hub.
pub struct HubService {
    handle: HubHandle,
    session: JoinHandle<()>,
    snapshots: Option<JoinHandle<u64>>,
}

impl HubService {
    /// Bind the transport and start serving.
    pub async fn start(settings: &HubSettings) -> Result<Self, LinkError> {
        let options = settings.to_transport_options();
        let supervisor = settings.to_supervisor_config();
        let hub = settings.to_hub_config();
        let network = &settings.network;

        let (handle, session) = match network.transport {
            TransportKind::Stream => {
                let acceptor = TcpAcceptor::bind(&network.listen_address, options).await?;
                let (session, handle) = ServerSession::new(acceptor, supervisor, hub);
                (handle, tokio::spawn(session.run()))
            }
            TransportKind::Datagram => {
                let connector = UdpConnector::new(
                    network.listen_address.clone(),
                    network.node_address.clone(),
                    options,
                );
                let (session, handle) = ServerSession::new(connector, supervisor, hub);
                (handle, tokio::spawn(session.run()))
            }
        };

        let snapshots = settings.snapshot_path().map(|path| {
            info!("writing snapshots to {}", path.display());
            let writer = SnapshotWriter::new(path, Duration::from_millis(settings.snapshot.min_interval_ms));
            tokio::spawn(writer.run(handle.frames(), handle.stop_handle()))
        });

        Ok(Self {
            handle,
            session,
            snapshots,
        })
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Wait for the session task (and the snapshot writer) to finish.
    pub async fn wait(self) {
        if let Err(e) = self.session.await {
            warn!("server session task failed: {e}");
        }
        if let Some(task) = self.snapshots {
            match task.await {
                Ok(written) => info!("{written} snapshots written"),
                Err(e) => warn!("snapshot task failed: {e}"),
            }
        }
        info!("hub stopped: {}", self.handle.status());
    }
}

// ── Tests ────────────────────────────────────────────────────────
