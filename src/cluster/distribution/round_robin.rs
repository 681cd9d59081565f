//! Round-robin target table for the reverse proxy.
//!
//! The event loop replaces the whole target list whenever the worker set
//! changes. Request tasks take a snapshot under the read lock and pick a
//! target with an atomic cursor, so they never see a half-built list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// One upstream worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub worker_id: u32,
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:8181`.
    pub base_url: String,
}

impl Target {
    pub fn new(worker_id: u32, addr: &str) -> Self {
        Self {
            worker_id,
            base_url: format!("http://{}", addr),
        }
    }
}

/// Targets plus the shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobinTable {
    targets: RwLock<Arc<[Target]>>,
    cursor: AtomicUsize,
}

impl RoundRobinTable {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: RwLock::new(targets.into()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Swap in a new target list.
    pub fn replace(&self, targets: Vec<Target>) {
        let targets: Arc<[Target]> = targets.into();
        *self.targets.write().unwrap_or_else(PoisonError::into_inner) = targets;
    }

    /// The current target list.
    pub fn snapshot(&self) -> Arc<[Target]> {
        Arc::clone(&*self.targets.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Pick the next target, or `None` when no worker is live.
    pub fn next(&self) -> Option<Target> {
        let targets = self.snapshot();
        if targets.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(targets[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
