//! Exit tracking for worker processes.
//!
//! Each spawned worker gets one task that waits for the process, applies any
//! control requests from the event loop, and reports a single
//! [`WorkerExitEvent`] when the process is gone.

use std::process::ExitStatus;

use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::spawn::{WorkerControl, send_interrupt};

/// Exit code reported when the real one cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// A worker process has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExitEvent {
    pub worker_id: u32,
    pub pid: u32,
    /// 0 for a clean exit, the OS status otherwise, [`UNKNOWN_EXIT_CODE`] if unknown.
    pub exit_code: i32,
}

impl WorkerExitEvent {
    pub fn is_clean(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal (POSIX only).
    Signaled(i32),
    /// The wait itself failed.
    Unknown,
}

impl TerminationReason {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::Signaled(sig);
            }
        }
        Self::Unknown
    }

    /// Collapse into the exit code carried by [`WorkerExitEvent`].
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(_) | Self::Unknown => UNKNOWN_EXIT_CODE,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Wait for `child` to finish while serving control requests, then report it.
pub(crate) async fn track_exit(
    mut child: Child,
    worker_id: u32,
    pid: u32,
    mut control: mpsc::UnboundedReceiver<WorkerControl>,
    exits: mpsc::Sender<WorkerExitEvent>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(cmd) = control.recv() => match cmd {
                WorkerControl::Interrupt => send_interrupt(worker_id, pid),
                WorkerControl::Kill => {
                    if let Err(e) = child.start_kill() {
                        warn!(worker_id, pid, error = %e, "Failed to kill worker");
                    }
                }
            },
        }
    };

    let reason = match status {
        Ok(status) => TerminationReason::from_status(status),
        Err(e) => {
            warn!(worker_id, pid, error = %e, "Waiting on worker failed");
            TerminationReason::Unknown
        }
    };
    debug!(worker_id, pid, reason = %reason, "Worker process finished");

    let event = WorkerExitEvent {
        worker_id,
        pid,
        exit_code: reason.exit_code(),
    };
    if exits.send(event).await.is_err() {
        debug!(worker_id, pid, "Supervisor gone, dropping exit event");
    }
}
