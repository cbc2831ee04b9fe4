//! Usage reconciliation.
//!
//! Persisted usage is recomputed from ground truth by a single worker task per quota kind. Callers mark a scope dirty
//! and enqueue a job. Each mark bumps a per-scope stamp, so the worker can tell whether a newer mark arrived while it
//! was computing: a scope is only marked clean when the stamp it started from is still current.
//!
//! The periodic sweep also expires pending reservations that nothing has touched for `pending_ttl_secs`, which
//! releases reservations of workflows that died without cancelling them.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use metrics::{counter, Counter};
use serde::Deserialize;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{QuotaError, StoreError},
    lock::{scope_lock_name, LockCoordinator},
    quota::{Quota, QuotaSchema},
    scope::ScopeKey,
    store::{overwrite, QuotaStore},
    usage::UsageSource,
};

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

const fn default_max_passes() -> usize {
    3
}

const fn default_pending_ttl_secs() -> u64 {
    3600
}

/// What to do when the job queue is full.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Wait for room in the queue.
    #[default]
    Block,

    /// Drop the job. The scope stays dirty and is picked up by the next sweep.
    Skip,
}

/// Reconciler settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ReconcilerConfig {
    /// Job queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Behavior when the queue is full.
    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,

    /// Seconds between sweeps of every stored quota row. Zero disables sweeping.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Passes a job makes over a scope that keeps being re-marked before leaving it to the next sweep.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Seconds a pending reservation row may go unchanged before a sweep removes it. Zero keeps rows forever.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_full_policy: QueueFullPolicy::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_passes: default_max_passes(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl ReconcilerConfig {
    fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_secs > 0).then(|| Duration::from_secs(self.pending_ttl_secs))
    }
}

/// Stores and locks a reconciler shares with its manager.
#[derive(Clone)]
pub struct ReconcilerStores {
    /// Limits, listed by the periodic sweep.
    pub limits: Arc<dyn QuotaStore>,

    /// Receives recomputed usage.
    pub usage: Arc<dyn QuotaStore>,

    /// Pending reservations, expired by the periodic sweep.
    pub pending: Arc<dyn QuotaStore>,

    /// Scope locks, taken before a pending row is removed.
    pub locks: Arc<dyn LockCoordinator>,

    /// How long to wait for a scope lock.
    pub lock_timeout: Duration,
}

struct Telemetry {
    jobs_processed: Counter,
    jobs_superseded: Counter,
    jobs_failed: Counter,
    jobs_dropped: Counter,
    repasses: Counter,
    sweeps: Counter,
    pending_expired: Counter,
}

impl Telemetry {
    fn new(kind: &str) -> Self {
        let kind = kind.to_string();
        Self {
            jobs_processed: counter!("allot.reconcile.jobs_processed", "kind" => kind.clone()),
            jobs_superseded: counter!("allot.reconcile.jobs_superseded", "kind" => kind.clone()),
            jobs_failed: counter!("allot.reconcile.jobs_failed", "kind" => kind.clone()),
            jobs_dropped: counter!("allot.reconcile.jobs_dropped", "kind" => kind.clone()),
            repasses: counter!("allot.reconcile.repasses", "kind" => kind.clone()),
            sweeps: counter!("allot.reconcile.sweeps", "kind" => kind.clone()),
            pending_expired: counter!("allot.reconcile.pending_expired", "kind" => kind),
        }
    }
}

#[derive(Default)]
struct DirtySet {
    entries: HashMap<String, (ScopeKey, u64)>,
    next_stamp: u64,
}

impl DirtySet {
    fn mark(&mut self, key: &ScopeKey) -> u64 {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.entries.insert(key.key_string(), (key.clone(), stamp));
        stamp
    }

    fn stamp(&self, key: &ScopeKey) -> Option<u64> {
        self.entries.get(&key.key_string()).map(|(_, stamp)| *stamp)
    }

    fn clear_if(&mut self, key: &ScopeKey, stamp: u64) -> bool {
        let key_string = key.key_string();
        match self.entries.get(&key_string) {
            Some((_, current)) if *current == stamp => {
                self.entries.remove(&key_string);
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

type Reply = oneshot::Sender<Result<Quota, QuotaError>>;

struct Job {
    key: ScopeKey,
    reply: Option<Reply>,
}

struct Shared {
    schema: Arc<QuotaSchema>,
    stores: ReconcilerStores,
    source: Arc<dyn UsageSource>,
    dirty: Mutex<DirtySet>,
    max_passes: usize,
    pending_ttl: Option<Duration>,
    telemetry: Telemetry,
}

fn unchanged_since(row: &Quota, cutoff: DateTime<Utc>) -> bool {
    row.updated_at().is_some_and(|updated_at| updated_at <= cutoff)
}

impl Shared {
    fn mark(&self, key: &ScopeKey) -> u64 {
        self.dirty.lock().unwrap().mark(key)
    }

    fn stamp(&self, key: &ScopeKey) -> Option<u64> {
        self.dirty.lock().unwrap().stamp(key)
    }

    fn clear_if(&self, key: &ScopeKey, stamp: u64) -> bool {
        self.dirty.lock().unwrap().clear_if(key, stamp)
    }

    async fn stored_usage(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        Ok(self
            .stores
            .usage
            .get(&self.schema, key)
            .await?
            .unwrap_or_else(|| Quota::zero(&self.schema, key.clone())))
    }

    /// Recomputes usage for `key` if it is dirty.
    ///
    /// Returns `None` when the key was already clean.
    async fn reconcile(&self, key: &ScopeKey) -> Result<Option<Quota>, QuotaError> {
        let mut latest = None;

        for pass in 0..self.max_passes {
            let Some(stamp) = self.stamp(key) else {
                return Ok(latest);
            };

            if pass > 0 {
                self.telemetry.repasses.increment(1);
                debug!(kind = self.schema.name(), scope = %key, pass, "Scope re-marked during recompute. Recomputing.");
            }

            let usage = self
                .source
                .fetch_usage(&self.schema, key)
                .await
                .map_err(|source| QuotaError::Store {
                    source: StoreError::Backend { source },
                })?;
            let stored = overwrite(self.stores.usage.as_ref(), usage.with_key(key.clone())).await?;
            latest = Some(stored);

            if self.clear_if(key, stamp) {
                return Ok(latest);
            }
        }

        warn!(
            kind = self.schema.name(),
            scope = %key,
            max_passes = self.max_passes,
            "Scope kept changing during recompute. Leaving it dirty for the next sweep."
        );
        Ok(latest)
    }

    async fn process(&self, job: Job) {
        let Job { key, reply } = job;

        let result = match self.reconcile(&key).await {
            Ok(Some(usage)) => {
                self.telemetry.jobs_processed.increment(1);
                Ok(usage)
            }
            Ok(None) => {
                self.telemetry.jobs_superseded.increment(1);
                self.stored_usage(&key).await
            }
            Err(e) => {
                self.telemetry.jobs_failed.increment(1);
                error!(kind = self.schema.name(), scope = %key, error = %e, "Failed to recompute usage.");
                Err(e)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    /// Removes pending rows unchanged since `cutoff`.
    async fn expire_pending(&self, cutoff: DateTime<Utc>) -> Result<usize, QuotaError> {
        let kind = self.schema.name();
        let pending = &self.stores.pending;
        let stale = pending
            .list(&self.schema)
            .await?
            .into_iter()
            .filter(|row| unchanged_since(row, cutoff))
            .collect::<Vec<_>>();

        let mut expired = 0;
        for row in stale {
            let key = row.key();
            let _guard = match self
                .stores
                .locks
                .acquire(&scope_lock_name(kind, key), self.stores.lock_timeout)
                .await
            {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(kind, scope = %key, error = %e, "Skipping pending expiry of busy scope.");
                    continue;
                }
            };

            // Re-read under the lock: a reservation may have landed since listing.
            match pending.get(&self.schema, key).await? {
                Some(current) if unchanged_since(&current, cutoff) => {
                    if pending.delete(&self.schema, key).await? {
                        expired += 1;
                        self.telemetry.pending_expired.increment(1);
                        warn!(kind, scope = %key, reserved = ?current, "Expired abandoned pending reservation.");
                    }
                }
                _ => {}
            }
        }

        Ok(expired)
    }

    async fn sweep(&self) {
        self.telemetry.sweeps.increment(1);

        if let Some(ttl) = self.pending_ttl {
            let cutoff = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
            if let Some(cutoff) = cutoff {
                if let Err(e) = self.expire_pending(cutoff).await {
                    error!(kind = self.schema.name(), error = %e, "Failed to expire pending reservations.");
                }
            }
        }

        let rows = match self.stores.limits.list(&self.schema).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(kind = self.schema.name(), error = %e, "Failed to list quotas for usage sweep.");
                return;
            }
        };

        let mut keys = rows.into_iter().map(|row| row.key().clone()).collect::<Vec<_>>();
        keys.extend(self.dirty.lock().unwrap().entries.values().map(|(key, _)| key.clone()));
        keys.sort_by_key(ScopeKey::key_string);
        keys.dedup();

        debug!(kind = self.schema.name(), scopes = keys.len(), "Sweeping usage.");
        for key in keys {
            self.mark(&key);
            self.process(Job { key, reply: None }).await;
        }
    }
}

async fn tick(sweeper: &mut Option<Interval>) {
    match sweeper {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_worker(shared: Arc<Shared>, mut jobs_rx: mpsc::Receiver<Job>, sweep_interval: Option<Duration>) {
    let mut sweeper = sweep_interval.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    info!(kind = shared.schema.name(), "Usage reconciler started.");

    loop {
        tokio::select! {
            maybe_job = jobs_rx.recv() => match maybe_job {
                Some(job) => shared.process(job).await,
                None => break,
            },
            _ = tick(&mut sweeper) => shared.sweep().await,
        }
    }

    info!(kind = shared.schema.name(), "Usage reconciler stopped.");
}

/// Recomputes persisted usage for one quota kind.
///
/// Cloning is cheap and every clone feeds the same worker. The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct UsageReconciler {
    shared: Arc<Shared>,
    jobs_tx: mpsc::Sender<Job>,
    policy: QueueFullPolicy,
}

impl UsageReconciler {
    /// Spawns the worker task on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn(
        schema: Arc<QuotaSchema>, stores: ReconcilerStores, source: Arc<dyn UsageSource>, config: &ReconcilerConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            telemetry: Telemetry::new(schema.name()),
            schema,
            stores,
            source,
            dirty: Mutex::new(DirtySet::default()),
            max_passes: config.max_passes.max(1),
            pending_ttl: config.pending_ttl(),
        });

        tokio::spawn(run_worker(Arc::clone(&shared), jobs_rx, config.sweep_interval()));

        Self {
            shared,
            jobs_tx,
            policy: config.queue_full_policy,
        }
    }

    /// Marks `key` dirty and enqueues a recompute.
    ///
    /// Returns `false` if the job was dropped because the queue was full. The key stays dirty either way.
    ///
    /// # Errors
    ///
    /// If the worker has stopped, an error is returned.
    pub async fn request_recompute(&self, key: &ScopeKey) -> Result<bool, QuotaError> {
        self.shared.mark(key);
        self.enqueue(Job {
            key: key.clone(),
            reply: None,
        })
        .await
    }

    /// Marks `key` dirty and enqueues a recompute without ever waiting for queue space.
    pub fn nudge(&self, key: &ScopeKey) {
        self.shared.mark(key);
        let job = Job {
            key: key.clone(),
            reply: None,
        };
        if self.jobs_tx.try_send(job).is_err() {
            self.shared.telemetry.jobs_dropped.increment(1);
            debug!(kind = self.shared.schema.name(), scope = %key, "Recompute queue unavailable. Leaving scope dirty.");
        }
    }

    /// Marks `key` dirty, enqueues a recompute and waits for the stored usage.
    ///
    /// # Errors
    ///
    /// If the job was dropped, the worker has stopped, or the recompute failed, an error is returned.
    pub async fn recompute(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        self.shared.mark(key);

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            key: key.clone(),
            reply: Some(reply_tx),
        };

        // A synchronous caller always waits for room.
        self.jobs_tx.send(job).await.map_err(|_| self.stopped())?;
        reply_rx.await.map_err(|_| self.stopped())?
    }

    /// Removes pending reservation rows unchanged since `cutoff`, returning how many were removed.
    ///
    /// Each row is removed under its scope lock. Rows whose lock is busy are left for the next sweep.
    pub async fn expire_pending(&self, cutoff: DateTime<Utc>) -> Result<usize, QuotaError> {
        self.shared.expire_pending(cutoff).await
    }

    /// Returns `true` if `key` is waiting for a recompute.
    pub fn is_dirty(&self, key: &ScopeKey) -> bool {
        self.shared.stamp(key).is_some()
    }

    /// Number of dirty scopes.
    pub fn dirty_len(&self) -> usize {
        self.shared.dirty.lock().unwrap().entries.len()
    }

    async fn enqueue(&self, job: Job) -> Result<bool, QuotaError> {
        match self.policy {
            QueueFullPolicy::Block => {
                self.jobs_tx.send(job).await.map_err(|_| self.stopped())?;
                Ok(true)
            }
            QueueFullPolicy::Skip => match self.jobs_tx.try_send(job) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(job)) => {
                    self.shared.telemetry.jobs_dropped.increment(1);
                    debug!(
                        kind = self.shared.schema.name(),
                        scope = %job.key,
                        "Recompute queue full. Leaving scope dirty for the next sweep."
                    );
                    Ok(false)
                }
                Err(TrySendError::Closed(_)) => Err(self.stopped()),
            },
        }
    }

    fn stopped(&self) -> QuotaError {
        QuotaError::ReconcilerStopped {
            kind: self.shared.schema.name().to_string(),
        }
    }
}
