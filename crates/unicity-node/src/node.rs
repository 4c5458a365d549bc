//! Node implementation.

use crate::chain::GenesisChain;
use crate::config::NodeConfig;
use crate::sync::HeaderSyncDriver;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use unicity_network::{
    AddressBook, BanList, NetworkService, TcpTransport, TcpTransportConfig, Transport,
};

/// How often the node logs a peer summary.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// The running node: network service plus the local chain and sync driver.
pub struct Node {
    config: NodeConfig,
    service: Arc<NetworkService>,
    sync: Arc<HeaderSyncDriver>,
}

impl Node {
    /// Create the data directory and wire the network service.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {:?}", config.data_dir)
        })?;
        let transport: Arc<dyn Transport> = TcpTransport::new(TcpTransportConfig::default());
        Self::with_transport(config, transport)
    }

    /// Wire the node over an arbitrary transport.
    pub fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let network_config = config.to_network_config()?;
        let chain = Arc::new(GenesisChain::new(network_config.network));
        info!(genesis = %chain.genesis(), "Loaded chain");

        let service = NetworkService::new(
            network_config,
            transport,
            Arc::new(AddressBook::new()),
            Arc::new(BanList::new()),
            chain.clone(),
        );
        let sync = Arc::new(HeaderSyncDriver::new(
            Arc::clone(service.peer_manager()),
            chain,
        ));
        service.set_header_sync(sync.clone());

        Ok(Arc::new(Self {
            config,
            service,
            sync,
        }))
    }

    pub fn service(&self) -> &Arc<NetworkService> {
        &self.service
    }

    /// Start networking and run until the service stops.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.service
            .start()
            .await
            .context("Failed to start network service")?;
        info!(network = %self.config.network, "Node started");

        let service = Arc::clone(&self.service);
        let network = tokio::spawn(async move { service.run().await });
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.tick().await;
        tokio::pin!(network);

        loop {
            tokio::select! {
                result = &mut network => {
                    result.context("Network task panicked")??;
                    break;
                }
                _ = status.tick() => self.log_status(),
            }
        }
        Ok(())
    }

    fn log_status(&self) {
        let stats = self.service.stats();
        info!(
            outbound = stats.counts.outbound,
            inbound = stats.counts.inbound,
            known_addresses = stats.known_addresses,
            headers = self.sync.headers_received(),
            time_offset = stats.time_offset,
            "Node status"
        );
    }

    /// Stop networking. Anchors are written on the way down.
    pub fn shutdown(&self) {
        info!("Shutting down node...");
        self.service.stop();
        info!("Node shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicity_network::MemoryTransport;

    fn regtest_config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default_for_network("regtest");
        config.data_dir = dir.to_path_buf();
        config.p2p.listen = false;
        config
    }

    #[tokio::test]
    async fn test_node_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = regtest_config(dir.path());
        config.data_dir = dir.path().join("nested");
        let node = Node::new(config).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert!(!node.service().is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::with_transport(regtest_config(dir.path()), MemoryTransport::new()).unwrap();
        let runner = Arc::clone(&node);
        let handle = tokio::spawn(async move { runner.run().await });
        while !node.service().is_running() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(dir.path().join("anchors.json").exists());
    }

    #[test]
    fn test_bad_manual_peer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = regtest_config(dir.path());
        config.p2p.connect = vec!["not an address".to_string()];
        assert!(Node::with_transport(config, MemoryTransport::new()).is_err());
    }
}
