//! Named scope locks.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::{error::QuotaError, scope::ScopeKey};

/// A held lock. Dropping it releases the lock.
pub struct LockGuard {
    name: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    /// Wraps a backend-specific guard.
    pub fn new<G>(name: impl Into<String>, held: G) -> Self
    where
        G: Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            _held: Box::new(held),
        }
    }

    /// Returns the lock name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Provides named critical sections.
///
/// Callers that take several locks must take them in one global order.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Acquires the lock called `name`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// If the lock is not acquired in time, an error is returned. Callers must treat this as a denial.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, QuotaError>;
}

/// Name of the lock that serializes writes to `key`'s rows of `kind`.
pub(crate) fn scope_lock_name(kind: &str, key: &ScopeKey) -> String {
    format!("{}/{}", kind, key)
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-process lock coordinator.
///
/// Keeps one async mutex per name. Entries are removed once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct LocalLockCoordinator {
    table: LockTable,
}

impl LocalLockCoordinator {
    /// Creates a new `LocalLockCoordinator`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of names with a live lock entry.
    pub fn live_locks(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

// The table holds one reference. Anything more is a holder or a waiter.
fn prune(table: &LockTable, name: &str) {
    let mut table = table.lock().unwrap();
    if table.get(name).is_some_and(|entry| Arc::strong_count(entry) == 1) {
        table.remove(name);
    }
}

struct LocalHeld {
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
    name: String,
}

impl Drop for LocalHeld {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.table, &self.name);
        trace!(lock = %self.name, "Released lock.");
    }
}

#[async_trait]
impl LockCoordinator for LocalLockCoordinator {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, QuotaError> {
        let entry = {
            let mut table = self.table.lock().unwrap();
            Arc::clone(table.entry(name.to_string()).or_default())
        };

        match tokio::time::timeout(timeout, entry.lock_owned()).await {
            Ok(guard) => {
                trace!(lock = name, "Acquired lock.");
                let held = LocalHeld {
                    guard: Some(guard),
                    table: Arc::clone(&self.table),
                    name: name.to_string(),
                };
                Ok(LockGuard::new(name, held))
            }
            Err(_) => {
                prune(&self.table, name);
                Err(QuotaError::LockTimeout {
                    name: name.to_string(),
                    waited: timeout,
                })
            }
        }
    }
}
