//! The master's event loop.
//!
//! One task owns the live worker set and makes every restart and shutdown
//! decision. Process waits, OS signals and the proxy server run elsewhere and
//! only talk to the loop through channels, so events are handled one at a
//! time in arrival order.
//!
//! ```text
//!   Starting ──all spawned──▶ Running ──signal──▶ Stopping ──live set empty──▶ Stopped
//!                                │                   │
//!                  exit != 0: respawn same id        grace timer: kill the rest
//!                  exit == 0: drop from pool
//! ```

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Sleep, sleep};
use tracing::{debug, error, info, instrument, warn};

use super::distribution::TrafficDistributor;
use super::exit::WorkerExitEvent;
use super::spawn::{Launcher, WorkerHandle};
use crate::error::{ClusterError, Result};

/// How long workers get to exit after being interrupted.
pub const WORKER_GRACE: Duration = Duration::from_secs(8);

/// How long the public proxy gets to finish in-flight requests.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(8);

/// Lifecycle of a supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// OS request to stop the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "interrupt"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Counters reported when the supervisor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Worker processes started, including restarts.
    pub spawned: usize,
    /// Crashed workers that were started again.
    pub restarts: usize,
    /// Workers that exited with code 0 while running and were not replaced.
    pub clean_exits: usize,
    /// Workers killed after the grace window.
    pub force_killed: usize,
}

/// Everything the loop reacts to.
#[derive(Debug)]
enum Event {
    Exit(WorkerExitEvent),
    Signal(ShutdownSignal),
    ServerFailed(ClusterError),
    GraceExpired,
}

/// Supervises a fixed-size pool of workers.
pub struct Supervisor<L: Launcher> {
    launcher: L,
    distributor: Box<dyn TrafficDistributor>,
    worker_count: u32,
    worker_grace: Duration,
    drain_deadline: Duration,
    state: SupervisorState,
    live: BTreeMap<u32, WorkerHandle>,
    exits_tx: mpsc::Sender<WorkerExitEvent>,
    exits_rx: mpsc::Receiver<WorkerExitEvent>,
    errors_tx: mpsc::Sender<ClusterError>,
    errors_rx: mpsc::Receiver<ClusterError>,
    grace_timer: Option<Pin<Box<Sleep>>>,
    fatal: Option<ClusterError>,
    stats: SupervisorStats,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, distributor: Box<dyn TrafficDistributor>, worker_count: u32) -> Self {
        let worker_count = worker_count.max(1);
        let (exits_tx, exits_rx) = mpsc::channel(worker_count as usize * 2);
        let (errors_tx, errors_rx) = mpsc::channel(4);
        Self {
            launcher,
            distributor,
            worker_count,
            worker_grace: WORKER_GRACE,
            drain_deadline: DRAIN_DEADLINE,
            state: SupervisorState::Starting,
            live: BTreeMap::new(),
            exits_tx,
            exits_rx,
            errors_tx,
            errors_rx,
            grace_timer: None,
            fatal: None,
            stats: SupervisorStats::default(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run the cluster until every worker has exited.
    ///
    /// Returns an error if startup fails (after killing any started workers),
    /// if a crashed worker could not be started again, or if the public server
    /// failed while running. The first such error wins.
    #[instrument(level = "debug", skip_all, fields(workers = self.worker_count, distribution = self.distributor.name()))]
    pub async fn run(mut self, mut signals: mpsc::Receiver<ShutdownSignal>) -> Result<SupervisorStats> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Cluster startup failed");
            self.abort_startup().await;
            return Err(e);
        }
        self.state = SupervisorState::Running;
        info!(workers = self.live.len(), "Cluster running");

        while !self.live.is_empty() {
            let event = tokio::select! {
                Some(exit) = self.exits_rx.recv() => Event::Exit(exit),
                Some(signal) = signals.recv() => Event::Signal(signal),
                Some(err) = self.errors_rx.recv() => Event::ServerFailed(err),
                () = grace_expired(&mut self.grace_timer) => Event::GraceExpired,
            };
            self.handle(event).await;
        }

        // The proxy may still be serving if every worker left on its own
        self.distributor.drain(self.drain_deadline).await;
        self.state = SupervisorState::Stopped;
        info!(
            spawned = self.stats.spawned,
            restarts = self.stats.restarts,
            clean_exits = self.stats.clean_exits,
            force_killed = self.stats.force_killed,
            "Cluster stopped"
        );

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    async fn start(&mut self) -> Result<()> {
        for id in 1..=self.worker_count {
            self.spawn(id)?;
        }
        self.publish();
        self.distributor.start(self.errors_tx.clone()).await
    }

    /// Kill everything started so far and wait for it to go away.
    async fn abort_startup(&mut self) {
        for worker in self.live.values() {
            worker.kill();
        }
        let deadline = sleep(self.worker_grace);
        tokio::pin!(deadline);
        while !self.live.is_empty() {
            tokio::select! {
                Some(exit) = self.exits_rx.recv() => {
                    self.live.remove(&exit.worker_id);
                }
                () = &mut deadline => {
                    warn!(remaining = self.live.len(), "Workers still running after startup abort");
                    break;
                }
            }
        }
        self.live.clear();
        self.state = SupervisorState::Stopped;
    }

    fn spawn(&mut self, id: u32) -> Result<()> {
        let internal_addr = self.distributor.worker_address(id)?;
        let handle = self
            .launcher
            .launch(id, internal_addr.as_deref(), &self.exits_tx)?;
        self.live.insert(id, handle);
        self.stats.spawned += 1;
        Ok(())
    }

    /// Hand the current live set to the distributor.
    fn publish(&self) {
        let live: Vec<&WorkerHandle> = self.live.values().collect();
        self.distributor.workers_changed(&live);
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Exit(exit) => self.on_exit(exit),
            Event::Signal(signal) => {
                if self.state == SupervisorState::Running {
                    info!(%signal, "Shutdown requested");
                    self.begin_shutdown().await;
                } else {
                    debug!(%signal, "Already stopping");
                }
            }
            Event::ServerFailed(err) => {
                error!(error = %err, "Public server failed");
                if self.fatal.is_none() {
                    self.fatal = Some(err);
                }
                if self.state == SupervisorState::Running {
                    self.begin_shutdown().await;
                }
            }
            Event::GraceExpired => {
                self.grace_timer = None;
                warn!(
                    remaining = self.live.len(),
                    grace_secs = self.worker_grace.as_secs(),
                    "Workers did not exit in time, killing"
                );
                for worker in self.live.values() {
                    warn!(worker_id = worker.id, pid = worker.pid, "Force-killing worker");
                    worker.kill();
                }
                self.stats.force_killed += self.live.len();
            }
        }
    }

    fn on_exit(&mut self, exit: WorkerExitEvent) {
        match self.live.get(&exit.worker_id) {
            Some(worker) if worker.pid == exit.pid => {}
            _ => {
                debug!(worker_id = exit.worker_id, pid = exit.pid, "Ignoring exit of unknown worker");
                return;
            }
        }
        self.live.remove(&exit.worker_id);

        match self.state {
            SupervisorState::Running if exit.is_clean() => {
                info!(
                    worker_id = exit.worker_id,
                    pid = exit.pid,
                    "Worker exited cleanly, not restarting"
                );
                self.stats.clean_exits += 1;
            }
            SupervisorState::Running => {
                warn!(
                    worker_id = exit.worker_id,
                    pid = exit.pid,
                    exit_code = exit.exit_code,
                    "Worker crashed, restarting"
                );
                match self.spawn(exit.worker_id) {
                    Ok(()) => self.stats.restarts += 1,
                    Err(e) => {
                        error!(
                            worker_id = exit.worker_id,
                            error = %e,
                            "Failed to restart worker, removing it from the pool"
                        );
                        if self.fatal.is_none() {
                            self.fatal = Some(e);
                        }
                    }
                }
            }
            _ => info!(
                worker_id = exit.worker_id,
                pid = exit.pid,
                exit_code = exit.exit_code,
                remaining = self.live.len(),
                "Worker stopped"
            ),
        }
        self.publish();
    }

    async fn begin_shutdown(&mut self) {
        self.state = SupervisorState::Stopping;
        self.distributor.drain(self.drain_deadline).await;

        for worker in self.live.values() {
            debug!(worker_id = worker.id, pid = worker.pid, "Interrupting worker");
            worker.interrupt();
        }
        self.grace_timer = Some(Box::pin(sleep(self.worker_grace)));
    }
}

/// Resolves when the grace timer fires; pending while it is unarmed.
async fn grace_expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
