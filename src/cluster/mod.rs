//! Multi-process clustering for a network service.
//!
//! The same binary runs in two roles. Launched normally it becomes the
//! **master**: it starts N copies of itself as **workers**, restarts the ones
//! that crash, and coordinates a graceful shutdown on SIGINT/SIGTERM. Workers
//! serve traffic; the master does not, except as a round-robin proxy on
//! platforms without `SO_REUSEPORT`.
//!
//! ```no_run
//! use herd::cluster::{self, ClusterOptions};
//!
//! # async fn serve(listener: tokio::net::TcpListener) -> Result<(), herd::error::ClusterError> { Ok(()) }
//! # async fn demo() -> Result<(), herd::error::ClusterError> {
//! let options = ClusterOptions {
//!     enabled: true,
//!     ..ClusterOptions::default()
//! };
//! let worker_options = options.clone();
//! cluster::run(&options, || async move {
//!     let listener = cluster::bind_listener(&worker_options).await?;
//!     serve(listener).await
//! })
//! .await
//! # }
//! ```

pub mod distribution;
pub mod exit;
pub mod options;
pub mod role;
pub mod signals;
pub mod spawn;
pub mod supervisor;

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

pub use exit::{TerminationReason, WorkerExitEvent};
pub use options::{ClusterOptions, DistributionMode};
pub use role::{Role, WorkerIdentity};
pub use signals::shutdown_requested;
pub use spawn::{Launcher, ProcessLauncher, WorkerHandle};
pub use supervisor::{ShutdownSignal, Supervisor, SupervisorState, SupervisorStats};

use crate::error::{ClusterError, Result};

/// Run `worker_main` under the cluster described by `options`.
///
/// - Clustering disabled: `worker_main` runs in this process.
/// - Worker role: `worker_main` runs in this process.
/// - Master role: workers are spawned and supervised until shutdown; `worker_main`
///   is not called here.
pub async fn run<F, Fut, E>(options: &ClusterOptions, worker_main: F) -> std::result::Result<(), E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: From<ClusterError>,
{
    if !options.enabled {
        debug!("Clustering disabled, serving in-process");
        return worker_main().await;
    }

    match Role::detect() {
        Role::Worker => worker_main().await,
        Role::Master => {
            run_master(options).await?;
            Ok(())
        }
    }
}

async fn run_master(options: &ClusterOptions) -> Result<SupervisorStats> {
    let listen = options.listen_addr()?;
    let worker_count = options.resolved_worker_count();
    let distributor = distribution::select(options.distribution, listen)?;
    let launcher = ProcessLauncher::current()?;

    info!(
        pid = std::process::id(),
        workers = worker_count,
        distribution = distributor.name(),
        listen = %listen,
        "Starting cluster master"
    );

    let signals = signals::forward_shutdown_signals()?;
    Supervisor::new(launcher, distributor, worker_count)
        .run(signals)
        .await
}

/// The identity of this process if it is a cluster worker.
pub fn current_worker() -> Result<Option<WorkerIdentity>> {
    if Role::detect().is_worker() {
        WorkerIdentity::from_env()
    } else {
        Ok(None)
    }
}

/// Open the listener a worker (or a non-clustered process) should serve on.
///
/// - Not clustered: a plain bind of the listen address.
/// - Proxy-mode worker: a plain bind of the internal address from the master.
/// - Kernel-mode worker: a shared bind of the listen address.
pub async fn bind_listener(options: &ClusterOptions) -> Result<TcpListener> {
    let listen = options.listen_addr()?;
    if !options.enabled {
        return bind_plain(listen).await;
    }

    match current_worker()? {
        Some(WorkerIdentity {
            internal_addr: Some(addr),
            ..
        }) => {
            let addr = options::parse_listen_addr(&addr)?;
            bind_plain(addr).await
        }
        Some(_) => distribution::bind_shared(listen),
        None => bind_plain(listen).await,
    }
}

async fn bind_plain(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| ClusterError::Bind {
        addr: addr.to_string(),
        source,
    })
}
