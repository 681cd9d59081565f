//! Worker subprocess spawning.
//!
//! Workers are the current executable re-run with the same arguments. The
//! master tells them apart through [`ROLE_ENV`], [`WORKER_ID_ENV`] and, in
//! proxy mode, [`WORKER_ADDR_ENV`].

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::exit::{WorkerExitEvent, track_exit};
use super::role::{ROLE_ENV, WORKER_ADDR_ENV, WORKER_ID_ENV, WORKER_ROLE};
use crate::error::{ClusterError, Result};

/// Request sent from the event loop to a worker's exit tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    /// Ask the worker to shut down on its own.
    Interrupt,
    /// Terminate the worker unconditionally.
    Kill,
}

/// The event loop's view of one live worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: u32,
    pub pid: u32,
    /// Loopback address the worker serves on (proxy mode only).
    pub internal_addr: Option<String>,
    control: mpsc::UnboundedSender<WorkerControl>,
}

impl WorkerHandle {
    pub fn new(
        id: u32,
        pid: u32,
        internal_addr: Option<String>,
        control: mpsc::UnboundedSender<WorkerControl>,
    ) -> Self {
        Self {
            id,
            pid,
            internal_addr,
            control,
        }
    }

    /// Request a cooperative shutdown. Returns false if the worker is already gone.
    pub fn interrupt(&self) -> bool {
        self.control.send(WorkerControl::Interrupt).is_ok()
    }

    /// Request forceful termination. Returns false if the worker is already gone.
    pub fn kill(&self) -> bool {
        self.control.send(WorkerControl::Kill).is_ok()
    }
}

/// Starts worker processes for the supervisor.
///
/// A launcher must arrange for exactly one [`WorkerExitEvent`] to be sent on
/// `exits` when the launched worker terminates.
pub trait Launcher: Send {
    fn launch(
        &mut self,
        id: u32,
        internal_addr: Option<&str>,
        exits: &mpsc::Sender<WorkerExitEvent>,
    ) -> Result<WorkerHandle>;
}

/// Launches workers by re-executing a program, by default the running binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the current binary with the arguments it was started with.
    pub fn current() -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1).collect()))
    }

    fn command(&self, id: u32, internal_addr: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .env(ROLE_ENV, WORKER_ROLE)
            .env(WORKER_ID_ENV, id.to_string());

        // A restarted master may itself carry an address from an earlier run
        match internal_addr {
            Some(addr) => cmd.env(WORKER_ADDR_ENV, addr),
            None => cmd.env_remove(WORKER_ADDR_ENV),
        };
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &mut self,
        id: u32,
        internal_addr: Option<&str>,
        exits: &mpsc::Sender<WorkerExitEvent>,
    ) -> Result<WorkerHandle> {
        let child = self
            .command(id, internal_addr)
            .spawn()
            .map_err(|e| ClusterError::Spawn { id, source: e })?;
        let pid = child
            .id()
            .ok_or_else(|| ClusterError::Worker(format!("Worker {} exited before it was tracked", id)))?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(track_exit(child, id, pid, control_rx, exits.clone()));

        info!(worker_id = id, pid, internal_addr, "Worker started");
        Ok(WorkerHandle::new(
            id,
            pid,
            internal_addr.map(str::to_string),
            control_tx,
        ))
    }
}

/// Send SIGINT to a worker.
#[cfg(unix)]
pub(crate) fn send_interrupt(worker_id: u32, pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => debug!(worker_id, pid, "Sent interrupt to worker"),
        Err(e) => debug!(worker_id, pid, error = %e, "Failed to interrupt worker"),
    }
}

/// Windows has no way to deliver an interrupt to another process; the grace
/// timer kills the worker instead.
#[cfg(not(unix))]
pub(crate) fn send_interrupt(worker_id: u32, pid: u32) {
    debug!(
        worker_id,
        pid, "Interrupt not supported on this platform, waiting for grace timer"
    );
}
