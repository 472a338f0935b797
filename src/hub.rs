//! Hub facade wiring the connection plane together
//!
//! Builds the queue, connection manager, network monitor, and streamable
//! server from one configuration, performs the initial discovery scan,
//! and accepts discovery deltas pushed by the external watcher.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::config::HubConfig;
use crate::core::error::HubResult;
use crate::instance::discovery::{DiscoveryDelta, scan_instances_dir};
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::net::monitor::{MonitorConfig, NetworkMonitor};
use crate::queue::MessageQueue;
use crate::server::proxy::HubRouter;
use crate::server::streamable::StreamableServer;

/// The multiplexing hub
pub struct Hub {
    queue: Arc<MessageQueue>,
    manager: ConnectionManager,
    monitor: NetworkMonitor,
    server: StreamableServer,
    discovery_dir: Option<PathBuf>,
    addr: Option<SocketAddr>,
}

impl Hub {
    /// Wire up all components from configuration. Nothing runs until
    /// [`Hub::start`].
    pub fn new(config: HubConfig) -> Self {
        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let manager = ConnectionManager::spawn(
            config.client.clone(),
            config.use_robust_networking,
            ManagerConfig::default(),
        );
        let monitor = NetworkMonitor::new(MonitorConfig::default());
        manager.attach_monitor(&monitor);

        let server = StreamableServer::new(
            config.server.clone(),
            HubRouter::new(manager.clone()),
            queue.clone(),
        );

        Self {
            queue,
            manager,
            monitor,
            server,
            discovery_dir: None,
            addr: None,
        }
    }

    /// Use a discovery directory: scanned once at start, then driven by
    /// pushed deltas.
    pub fn with_discovery_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.discovery_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Start background cleanup, the network monitor, the HTTP server,
    /// and run the initial discovery scan. Instances registered before
    /// this call are preserved.
    pub async fn start(&mut self) -> HubResult<SocketAddr> {
        self.queue.start_cleanup();
        self.monitor.start();

        let addr = self.server.start().await?;
        self.addr = Some(addr);

        if let Some(dir) = self.discovery_dir.clone() {
            match scan_instances_dir(&dir) {
                Ok(instances) => {
                    info!(count = instances.len(), dir = %dir.display(), "initial discovery scan");
                    for instance in instances {
                        self.manager.register(instance).await;
                    }
                }
                Err(err) => warn!(dir = %dir.display(), %err, "initial discovery scan failed"),
            }
        }

        info!(%addr, "hub started");
        Ok(addr)
    }

    /// Apply a delta pushed by the external discovery watcher
    pub async fn apply_delta(&self, delta: DiscoveryDelta) {
        match delta {
            DiscoveryDelta::Added(instance) => self.manager.register(instance).await,
            DiscoveryDelta::Removed(instance_id) => self.manager.deregister(&instance_id).await,
        }
    }

    /// The connection manager handle
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// The shared message queue
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// The streamable server
    pub fn server(&self) -> &StreamableServer {
        &self.server
    }

    /// Bound address once started
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop the server, monitor, and connection manager
    pub async fn stop(&mut self) {
        self.server.stop().await;
        self.monitor.stop();
        self.manager.shutdown().await;
        info!("hub stopped");
    }
}
