//! Cluster configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ClusterError, Result};

/// Default public listen address.
pub const DEFAULT_LISTEN: &str = ":8080";

/// Offset added to the public port to derive worker ports in proxy mode.
pub const INTERNAL_PORT_OFFSET: u16 = 100;

/// How inbound traffic reaches the workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// Kernel sharing where the platform supports it, proxy otherwise.
    #[default]
    Auto,
    /// Every worker binds the public address with `SO_REUSEPORT`.
    Kernel,
    /// The master binds the public address and proxies round robin.
    Proxy,
}

impl FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "kernel" | "reuseport" => Ok(Self::Kernel),
            "proxy" => Ok(Self::Proxy),
            _ => Err(format!(
                "Unknown distribution mode: '{}'. Valid options: auto, kernel, proxy",
                s
            )),
        }
    }
}

impl std::fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Kernel => write!(f, "kernel"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

/// Options handed to the supervisor by the application's config loader.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Run as a cluster. When false the application runs in-process.
    pub enabled: bool,
    /// Requested worker count; zero or negative means one per CPU.
    pub worker_count: i64,
    /// Public listen address, `host:port` or `:port`.
    pub listen_address: String,
    pub distribution: DistributionMode,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_count: 0,
            listen_address: DEFAULT_LISTEN.to_string(),
            distribution: DistributionMode::Auto,
        }
    }
}

impl ClusterOptions {
    /// Number of workers to run on this host.
    pub fn resolved_worker_count(&self) -> u32 {
        resolve_worker_count(self.worker_count, available_cpus())
    }

    /// Parsed public listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen_addr(&self.listen_address)
    }
}

/// Number of CPUs usable by this process (at least 1).
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Clamp a requested worker count to `[1, cpus]`.
///
/// Zero or negative requests mean one worker per CPU.
pub fn resolve_worker_count(requested: i64, cpus: usize) -> u32 {
    let cpus = cpus.max(1) as u64;
    let count = if requested <= 0 {
        cpus
    } else {
        (requested as u64).min(cpus)
    };
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Parse a listen address. A bare `:port` binds all IPv4 interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let trimmed = addr.trim();
    let invalid = || ClusterError::InvalidListenAddress(addr.to_string());

    if let Some(port) = trimmed.strip_prefix(':') {
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Some(port) = trimmed.strip_prefix("localhost:") {
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    trimmed.parse::<SocketAddr>().map_err(|_| invalid())
}

/// Internal loopback address of a worker in proxy mode.
pub fn internal_worker_addr(base_port: u16, id: u32) -> Result<SocketAddr> {
    let port = u32::from(base_port) + u32::from(INTERNAL_PORT_OFFSET) + id;
    let port = u16::try_from(port).map_err(|_| ClusterError::PortOutOfRange { base_port, id })?;
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}
