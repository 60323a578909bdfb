//! Configuration file structures and parsing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::upstream::split_host_port;

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (default: all IPv4 interfaces)
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// TCP port to listen on (default: 53)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Deadline for reading a query from and writing the answer to a client
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    53
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            log_level: default_log_level(),
            client_timeout_secs: default_client_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// DNS-over-TLS upstreams
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream resolvers as `host:port`, dialed in this order
    pub hosts: Vec<String>,
    /// Deadline for each dial, write and read on an upstream connection
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_upstream_timeout() -> u64 {
    5
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.upstream.hosts.is_empty() {
            anyhow::bail!("No upstream hosts configured");
        }

        for host in &self.upstream.hosts {
            split_host_port(host).with_context(|| format!("Invalid upstream '{}'", host))?;
        }

        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be greater than zero");
        }
        if self.server.client_timeout_secs == 0 {
            anyhow::bail!("server.client_timeout_secs must be greater than zero");
        }

        Ok(())
    }
}
