//! Kernel-balanced distribution through shared port binding.
//!
//! Every worker opens its own listener on the public address with
//! `SO_REUSEADDR` and `SO_REUSEPORT`; the kernel spreads new connections
//! across them. The master binds nothing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::debug;

use super::TrafficDistributor;
use crate::cluster::spawn::WorkerHandle;
use crate::error::{ClusterError, Result};

/// Pending connection backlog for shared listeners.
const LISTEN_BACKLOG: i32 = 1024;

/// Whether this platform can share a port between processes.
pub const fn shared_bind_supported() -> bool {
    cfg!(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))
}

/// Bind `addr` so that other processes can bind it too.
///
/// Must be called from within a Tokio runtime.
pub fn bind_shared(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    if !shared_bind_supported() {
        return Err(ClusterError::SharedBindUnsupported);
    }
    let bind_err = bind_error(addr);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(&bind_err)?;
    socket.set_reuse_address(true).map_err(&bind_err)?;
    set_reuse_port(&socket).map_err(&bind_err)?;
    socket.set_nonblocking(true).map_err(&bind_err)?;
    socket.bind(&addr.into()).map_err(&bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(&bind_err)?;

    let listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(listener).map_err(&bind_err)
}

fn bind_error(addr: SocketAddr) -> impl Fn(io::Error) -> ClusterError {
    move |source| ClusterError::Bind {
        addr: addr.to_string(),
        source,
    }
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Distributor where the kernel does the balancing.
#[derive(Debug, Default)]
pub struct KernelSharedSocket;

impl KernelSharedSocket {
    /// Fails on platforms without `SO_REUSEPORT`; there is no fallback.
    pub fn new() -> Result<Self> {
        if !shared_bind_supported() {
            return Err(ClusterError::SharedBindUnsupported);
        }
        Ok(Self)
    }
}

#[async_trait]
impl TrafficDistributor for KernelSharedSocket {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn worker_address(&self, _id: u32) -> Result<Option<String>> {
        Ok(None)
    }

    async fn start(&mut self, _errors: mpsc::Sender<ClusterError>) -> Result<()> {
        debug!("Workers bind the public address themselves");
        Ok(())
    }

    fn workers_changed(&self, _live: &[&WorkerHandle]) {}

    async fn drain(&mut self, _deadline: Duration) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_listeners_share_a_port() {
        let first = bind_shared("127.0.0.1:0".parse().unwrap()).expect("first bind");
        let addr = first.local_addr().unwrap();
        let second = bind_shared(addr).expect("second bind on same port");
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_shared_listener_accepts() {
        let listener = bind_shared("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { tokio::net::TcpStream::connect(addr).await });
        let (_stream, _) = listener.accept().await.expect("accept");
        client.await.unwrap().expect("connect");
    }

    #[test]
    fn test_bind_error_names_the_address() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let err = bind_error(addr)(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(&err, ClusterError::Bind { addr, .. } if addr == "127.0.0.1:8080"));
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:8080"));
    }

    #[test]
    fn test_kernel_distributor_has_no_internal_addresses() {
        let dist = KernelSharedSocket::new().expect("supported on unix");
        assert_eq!(dist.worker_address(1).unwrap(), None);
        assert_eq!(dist.name(), "kernel");
    }
}
