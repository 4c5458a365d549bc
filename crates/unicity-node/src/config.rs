//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use unicity_network::protocol::{parse_peer_address, NetworkType};
use unicity_network::NetworkConfig;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network (mainnet, testnet, regtest).
    pub network: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// P2P configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// P2P configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Accept inbound connections.
    pub listen: bool,
    /// Listen port; the network's default when unset.
    pub port: Option<u16>,
    /// Peers to connect to manually.
    pub connect: Vec<String>,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub max_inbound_per_ip: usize,
    pub enable_feelers: bool,
    /// Oldest protocol version accepted from peers.
    pub min_protocol_version: i32,
}

impl Default for P2pConfig {
    fn default() -> Self {
        let defaults = NetworkConfig::default();
        Self {
            listen: true,
            port: None,
            connect: Vec::new(),
            max_outbound: defaults.manager.max_outbound,
            max_inbound: defaults.manager.max_inbound,
            max_inbound_per_ip: defaults.manager.max_inbound_per_ip,
            enable_feelers: true,
            min_protocol_version: defaults.peer.min_protocol_version,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(&args.network)
        };

        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }

        config.network = args.network.clone();

        if let Some(port) = args.port {
            config.p2p.port = Some(port);
        }
        if args.no_listen {
            config.p2p.listen = false;
        }
        if !args.connect.is_empty() {
            config.p2p.connect = args.connect.clone();
        }
        if let Some(ref level) = args.log_level {
            config.log_level = level.clone();
        }

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let data_dir = match network {
            "testnet" => PathBuf::from(".unicity-testnet"),
            "regtest" => PathBuf::from(".unicity-regtest"),
            _ => PathBuf::from(".unicity"),
        };

        Self {
            network: network.to_string(),
            data_dir,
            log_level: default_log_level(),
            p2p: P2pConfig::default(),
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn network_type(&self) -> Result<NetworkType> {
        self.network
            .parse::<NetworkType>()
            .with_context(|| format!("Unknown network '{}'", self.network))
    }

    /// Translate into the network service's configuration.
    pub fn to_network_config(&self) -> Result<NetworkConfig> {
        let network = self.network_type()?;
        let mut config = NetworkConfig::for_network(network);
        config.listen = self.p2p.listen;
        if let Some(port) = self.p2p.port {
            config.listen_port = port;
        }
        config.connect = self
            .p2p
            .connect
            .iter()
            .map(|s| {
                parse_peer_address(s, network.default_port())
                    .with_context(|| format!("Invalid peer address '{}'", s))
            })
            .collect::<Result<_>>()?;
        config.data_dir = Some(self.data_dir.clone());
        config.enable_feelers = self.p2p.enable_feelers;
        config.manager.max_outbound = self.p2p.max_outbound;
        config.manager.max_inbound = self.p2p.max_inbound;
        config.manager.max_inbound_per_ip = self.p2p.max_inbound_per_ip;
        config.peer.min_protocol_version = self.p2p.min_protocol_version;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default_for_network("mainnet");
        assert_eq!(config.network, "mainnet");
        let net = config.to_network_config().unwrap();
        assert_eq!(net.listen_port, 9590);
        assert_eq!(net.manager.max_outbound, 8);
        assert_eq!(net.manager.max_inbound, 125);
    }

    #[test]
    fn test_testnet_config() {
        let config = NodeConfig::default_for_network("testnet");
        assert!(config.data_dir.to_string_lossy().contains("testnet"));
        let net = config.to_network_config().unwrap();
        assert_eq!(net.peer.magic, NetworkType::Testnet.magic());
        assert_eq!(net.listen_port, 19590);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args {
            config: PathBuf::from("/nonexistent/unicity-node.toml"),
            network: "regtest".to_string(),
            port: Some(4000),
            no_listen: true,
            connect: vec!["127.0.0.1".to_string()],
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        let config = NodeConfig::load(&args.config, &args).unwrap();
        assert_eq!(config.log_level, "debug");
        let net = config.to_network_config().unwrap();
        assert_eq!(net.listen_port, 4000);
        assert!(!net.listen);
        let expected: std::net::SocketAddr = "127.0.0.1:29590".parse().unwrap();
        assert_eq!(net.connect, vec![expected]);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unicity-node.toml");
        let mut config = NodeConfig::default_for_network("regtest");
        config.p2p.max_outbound = 3;
        config.save(&path).unwrap();

        let args = Args {
            config: path.clone(),
            network: "regtest".to_string(),
            ..Default::default()
        };
        let loaded = NodeConfig::load(&path, &args).unwrap();
        assert_eq!(loaded.p2p.max_outbound, 3);
        assert_eq!(loaded.log_level, "info");
    }

    #[test]
    fn test_unknown_network_rejected() {
        let config = NodeConfig::default_for_network("moonnet");
        assert!(config.to_network_config().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            network = "mainnet"
            data_dir = "/tmp/unicity"

            [p2p]
            max_inbound = 10
            "#,
        )
        .unwrap();
        assert_eq!(parsed.p2p.max_inbound, 10);
        assert_eq!(parsed.p2p.max_outbound, 8);
        assert!(parsed.p2p.listen);
    }
}
