//! Server configuration, loaded from a TOML file.
//!
//! Relative certificate paths are resolved against the directory containing
//! the configuration file, so a config directory can be moved wholesale.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::defaults;
use crate::protocol::IpRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP endpoints to accept tunnel connections on. At least one is
    /// required to start the host.
    #[serde(default)]
    pub tcp_listeners: Vec<TcpListenerConfig>,

    /// UDP endpoints for session datagram channels. Optional; a port of 0
    /// lets the OS pick one.
    #[serde(default)]
    pub udp_listeners: Vec<UdpListenerConfig>,

    /// Time budget for a single request/response exchange.
    #[serde(with = "humantime_serde", default = "defaults::request_timeout")]
    pub request_timeout: Duration,

    #[serde(default = "defaults::max_message_length")]
    pub max_message_length: usize,

    #[serde(default = "defaults::max_request_head_length")]
    pub max_request_head_length: usize,

    #[serde(default = "defaults::accept_error_budget")]
    pub accept_error_budget: u32,

    #[serde(default = "defaults::max_datagram_channel_count")]
    pub max_datagram_channel_count: u32,

    #[serde(default)]
    pub network_filter: NetworkFilter,

    #[serde(default = "default_true")]
    pub is_ipv6_supported: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpListenerConfig {
    pub address: SocketAddr,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpListenerConfig {
    pub address: SocketAddr,
}

/// Address ranges published to clients in every `HelloResponse`, controlling
/// what they tunnel and what their packet capture claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkFilter {
    #[serde(default)]
    pub include_ip_ranges: Vec<IpRange>,
    #[serde(default)]
    pub exclude_ip_ranges: Vec<IpRange>,
    #[serde(default)]
    pub packet_capture_include_ip_ranges: Vec<IpRange>,
    #[serde(default)]
    pub packet_capture_exclude_ip_ranges: Vec<IpRange>,
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let config_path = config_path.as_ref();
        let contents = tokio::fs::read_to_string(config_path).await?;
        let mut config: Config = toml::from_str(&contents)?;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        for listener in &mut config.tcp_listeners {
            listener.certificate = relative_to(base, &listener.certificate);
            listener.private_key = relative_to(base, &listener.private_key);
        }
        Ok(config)
    }

    pub fn tcp_end_points(&self) -> Vec<SocketAddr> {
        self.tcp_listeners
            .iter()
            .map(|listener| listener.address)
            .collect()
    }

    pub fn udp_end_points(&self) -> Vec<SocketAddr> {
        self.udp_listeners
            .iter()
            .map(|listener| listener.address)
            .collect()
    }
}

fn relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
