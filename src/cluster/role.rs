//! Master/worker role detection.
//!
//! The master marks every child it spawns through environment variables.
//! These are read once, before anything binds a socket.

use crate::error::{ClusterError, Result};

/// Environment variable holding the process role.
pub const ROLE_ENV: &str = "ROLE";
/// Environment variable holding the worker id (1..N).
pub const WORKER_ID_ENV: &str = "WORKER_ID";
/// Environment variable holding the internal bind address (proxy mode only).
pub const WORKER_ADDR_ENV: &str = "WORKER_ADDR";

/// Value of [`ROLE_ENV`] for spawned workers.
pub const WORKER_ROLE: &str = "worker";

/// Which side of the cluster this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    /// Detect the role of the current process.
    pub fn detect() -> Self {
        Self::from_env_value(std::env::var(ROLE_ENV).ok().as_deref())
    }

    /// Any non-empty `ROLE` makes this process a worker.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Self::Worker,
            _ => Self::Master,
        }
    }

    pub fn is_worker(self) -> bool {
        self == Self::Worker
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Identity a worker was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub id: u32,
    /// Internal address to bind instead of the shared listen address.
    pub internal_addr: Option<String>,
}

impl WorkerIdentity {
    /// Read the identity injected by the master.
    ///
    /// Returns `Ok(None)` when this process is not a worker.
    pub fn from_env() -> Result<Option<Self>> {
        if !Role::detect().is_worker() {
            return Ok(None);
        }
        let raw_id = std::env::var(WORKER_ID_ENV).unwrap_or_default();
        let internal_addr = std::env::var(WORKER_ADDR_ENV).ok();
        Self::parse(&raw_id, internal_addr).map(Some)
    }

    fn parse(raw_id: &str, internal_addr: Option<String>) -> Result<Self> {
        let id = raw_id
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ClusterError::InvalidWorkerId(raw_id.to_string()))?;
        Ok(Self {
            id,
            internal_addr: internal_addr.filter(|a| !a.is_empty()),
        })
    }
}
