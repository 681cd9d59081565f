//! How inbound traffic reaches the workers.

mod kernel;
mod proxy;
mod round_robin;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use kernel::{KernelSharedSocket, bind_shared, shared_bind_supported};
pub use proxy::{ProxyState, RoundRobinProxy, proxy_router, targets_for};
pub use round_robin::{RoundRobinTable, Target};

use super::options::DistributionMode;
use super::spawn::WorkerHandle;
use crate::error::{ClusterError, Result};

/// A strategy for spreading requests across workers.
///
/// All methods are called from the supervisor's event loop only.
#[async_trait]
pub trait TrafficDistributor: Send {
    fn name(&self) -> &'static str;

    /// Internal address worker `id` should bind, if any.
    fn worker_address(&self, id: u32) -> Result<Option<String>>;

    /// Begin accepting public traffic. Errors from a server that fails later
    /// are delivered on `errors`.
    async fn start(&mut self, errors: mpsc::Sender<ClusterError>) -> Result<()>;

    /// The live worker set changed; `live` is the complete new set.
    fn workers_changed(&self, live: &[&WorkerHandle]);

    /// Stop accepting public traffic, waiting up to `deadline` for in-flight requests.
    async fn drain(&mut self, deadline: Duration);
}

/// Resolve `Auto` into the strategy this platform supports.
pub fn effective_mode(mode: DistributionMode) -> DistributionMode {
    match mode {
        DistributionMode::Auto if shared_bind_supported() => DistributionMode::Kernel,
        DistributionMode::Auto => DistributionMode::Proxy,
        other => other,
    }
}

/// Build the distributor for `mode` on the public address `listen`.
///
/// Proxy mode rejects port 0, since worker ports are offsets from the public port.
pub fn select(mode: DistributionMode, listen: SocketAddr) -> Result<Box<dyn TrafficDistributor>> {
    match effective_mode(mode) {
        DistributionMode::Proxy if listen.port() == 0 => {
            Err(ClusterError::ProxyNeedsFixedPort(listen))
        }
        DistributionMode::Proxy => Ok(Box::new(RoundRobinProxy::new(listen))),
        _ => Ok(Box::new(KernelSharedSocket::new()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_modes_are_kept() {
        assert_eq!(effective_mode(DistributionMode::Proxy), DistributionMode::Proxy);
        assert_eq!(effective_mode(DistributionMode::Kernel), DistributionMode::Kernel);
    }

    #[test]
    fn test_auto_follows_platform() {
        let expected = if shared_bind_supported() {
            DistributionMode::Kernel
        } else {
            DistributionMode::Proxy
        };
        assert_eq!(effective_mode(DistributionMode::Auto), expected);
    }

    #[test]
    fn test_select_proxy() {
        let dist = select(DistributionMode::Proxy, "127.0.0.1:8080".parse().unwrap()).unwrap();
        assert_eq!(dist.name(), "proxy");
    }

    #[test]
    fn test_select_proxy_rejects_port_zero() {
        let result = select(DistributionMode::Proxy, "127.0.0.1:0".parse().unwrap());
        assert!(matches!(result, Err(ClusterError::ProxyNeedsFixedPort(_))));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_select_auto_on_unix_is_kernel() {
        let dist = select(DistributionMode::Auto, "127.0.0.1:8080".parse().unwrap()).unwrap();
        assert_eq!(dist.name(), "kernel");
    }
}
