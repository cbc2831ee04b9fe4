//! Per-kind quota manager.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::{counter, Counter};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    config::QuotaConfiguration,
    error::{QuotaError, StoreError},
    lock::{scope_lock_name, LocalLockCoordinator, LockCoordinator, LockGuard},
    pending::PendingUsages,
    quota::{Quota, QuotaAction, QuotaSchema, QuotaUpdate},
    reconcile::{ReconcilerConfig, ReconcilerStores, UsageReconciler},
    scope::{sort_by_specificity, ScopeKey},
    store::{MemoryStore, QuotaStore, TableStore},
    usage::{OpenDirectory, ScopeDirectory, StaticUsageSource, UsageSource},
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits, usage and pending reservations of one scope.
#[derive(Clone, Debug)]
pub struct QuotaReport {
    /// Stored limits.
    pub quota: Quota,

    /// Persisted usage.
    pub usage: Quota,

    /// Pending reservations at or below the scope, most general first.
    pub pending: Vec<Quota>,
}

impl QuotaReport {
    /// Highest `usage / limit` ratio over every field with a non-zero limit.
    pub fn usage_rate(&self) -> f64 {
        self.quota
            .values()
            .iter()
            .zip(self.usage.values())
            .filter(|(limit, _)| **limit > 0)
            .map(|(limit, used)| *used as f64 / *limit as f64)
            .fold(0.0, f64::max)
    }

    /// Merges key fields, limits, `usage.`-prefixed usage and a `pending` array into one JSON object.
    pub fn to_json(&self) -> Value {
        let mut object = key_fields(self.quota.key());
        object.extend(self.quota.to_json(None));
        object.extend(self.usage.to_json(Some("usage")));

        let pending = self
            .pending
            .iter()
            .map(|p| {
                let mut entry = key_fields(p.key());
                entry.extend(p.to_json(None));
                Value::Object(entry)
            })
            .collect();
        object.insert("pending".to_string(), Value::Array(pending));

        Value::Object(object)
    }
}

fn key_fields(key: &ScopeKey) -> Map<String, Value> {
    key.populated()
        .map(|(field, value)| (field.to_string(), Value::from(value)))
        .collect()
}

/// Sorts reports by [`usage_rate`][QuotaReport::usage_rate], highest first.
pub fn sort_by_usage_rate(reports: &mut [QuotaReport]) {
    reports.sort_by(|a, b| b.usage_rate().total_cmp(&a.usage_rate()));
}

/// Selects rows for [`QuotaManager::list_quotas`].
#[derive(Clone, Debug, Default)]
pub struct QuotaListFilter {
    /// Only rows of this domain.
    pub domain_id: Option<String>,

    /// Only rows of this project.
    pub tenant_id: Option<String>,

    /// Only domain-level rows.
    pub domain_only: bool,

    /// Only rows without platform fields.
    pub primary_only: bool,
}

impl QuotaListFilter {
    fn matches(&self, key: &ScopeKey) -> bool {
        if self.domain_id.as_deref().is_some_and(|d| key.domain_id() != Some(d)) {
            return false;
        }
        if self.tenant_id.as_deref().is_some_and(|t| key.tenant_id() != Some(t)) {
            return false;
        }
        if self.domain_only && key.tenant_id().is_some() {
            return false;
        }
        !(self.primary_only && !key.is_base())
    }
}

struct Telemetry {
    admission_allowed: Counter,
    admission_denied: Counter,
    admission_failed: Counter,
    reservations: Counter,
    cancellations: Counter,
    rows_pruned: Counter,
}

impl Telemetry {
    fn new(kind: &str) -> Self {
        let kind = kind.to_string();
        Self {
            admission_allowed: counter!("allot.admission.allowed", "kind" => kind.clone()),
            admission_denied: counter!("allot.admission.denied", "kind" => kind.clone()),
            admission_failed: counter!("allot.admission.failed", "kind" => kind.clone()),
            reservations: counter!("allot.pending.reserved", "kind" => kind.clone()),
            cancellations: counter!("allot.pending.cancelled", "kind" => kind.clone()),
            rows_pruned: counter!("allot.quota.pruned", "kind" => kind),
        }
    }
}

struct Inner {
    schema: Arc<QuotaSchema>,
    limits: Arc<dyn QuotaStore>,
    pending: Arc<dyn QuotaStore>,
    usage: Arc<dyn QuotaStore>,
    locks: Arc<dyn LockCoordinator>,
    directory: Arc<dyn ScopeDirectory>,
    source: Arc<dyn UsageSource>,
    reconciler: UsageReconciler,
    auto_provision: bool,
    enforce: bool,
    lock_timeout: Duration,
    telemetry: Telemetry,
}

/// Builder for [`QuotaManager`].
pub struct QuotaManagerBuilder {
    schema: Arc<QuotaSchema>,
    limits: Option<Arc<dyn QuotaStore>>,
    pending: Option<Arc<dyn QuotaStore>>,
    usage: Option<Arc<dyn QuotaStore>>,
    locks: Option<Arc<dyn LockCoordinator>>,
    directory: Option<Arc<dyn ScopeDirectory>>,
    source: Option<Arc<dyn UsageSource>>,
    auto_provision: bool,
    enforce: bool,
    lock_timeout: Duration,
    reconciler: ReconcilerConfig,
}

impl QuotaManagerBuilder {
    /// Sets the store for limits. Defaults to a [`TableStore`].
    pub fn limit_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.limits = Some(store);
        self
    }

    /// Sets the store for pending reservations. Defaults to a [`MemoryStore`].
    pub fn pending_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.pending = Some(store);
        self
    }

    /// Sets the store for persisted usage. Defaults to a [`TableStore`].
    pub fn usage_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.usage = Some(store);
        self
    }

    /// Sets the lock coordinator. Defaults to a [`LocalLockCoordinator`].
    ///
    /// Lock names are prefixed with the kind, so one coordinator can be shared by every manager.
    pub fn lock_coordinator(mut self, locks: Arc<dyn LockCoordinator>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Sets the scope directory. Defaults to [`OpenDirectory`].
    pub fn directory(mut self, directory: Arc<dyn ScopeDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Sets the ground truth for usage. Defaults to an empty [`StaticUsageSource`].
    pub fn usage_source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets whether missing rows are created from defaults on first access.
    pub fn auto_provision(mut self, auto_provision: bool) -> Self {
        self.auto_provision = auto_provision;
        self
    }

    /// Sets whether exceeded limits deny admission.
    pub fn enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Sets how long to wait for a scope lock before failing.
    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Sets the reconciler settings.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Applies process-wide settings.
    pub fn with_configuration(self, config: &QuotaConfiguration) -> Self {
        self.auto_provision(config.auto_provision)
            .enforce(config.enforce)
            .lock_timeout(config.lock_timeout())
            .reconciler_config(config.reconcile.clone())
    }

    /// Builds the manager and spawns its usage reconciler.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> QuotaManager {
        let limits = self.limits.unwrap_or_else(|| Arc::new(TableStore::new()));
        let pending = self.pending.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let usage = self.usage.unwrap_or_else(|| Arc::new(TableStore::new()));
        let locks = self.locks.unwrap_or_else(|| Arc::new(LocalLockCoordinator::new()));
        let source = self.source.unwrap_or_else(|| Arc::new(StaticUsageSource::new()));

        let stores = ReconcilerStores {
            limits: Arc::clone(&limits),
            usage: Arc::clone(&usage),
            pending: Arc::clone(&pending),
            locks: Arc::clone(&locks),
            lock_timeout: self.lock_timeout,
        };
        let reconciler =
            UsageReconciler::spawn(Arc::clone(&self.schema), stores, Arc::clone(&source), &self.reconciler);

        QuotaManager {
            inner: Arc::new(Inner {
                telemetry: Telemetry::new(self.schema.name()),
                schema: self.schema,
                limits,
                pending,
                usage,
                locks,
                directory: self.directory.unwrap_or_else(|| Arc::new(OpenDirectory)),
                source,
                reconciler,
                auto_provision: self.auto_provision,
                enforce: self.enforce,
                lock_timeout: self.lock_timeout,
            }),
        }
    }
}

/// Manages limits, reservations and usage of one quota kind.
///
/// Check, reserve, cancel and administrative writes of a scope are serialized by the scope's lock. Checks also take
/// the locks of every stored ancestor row, since those limits bound the scope too. Locks are always taken general
/// first, which keeps concurrent checks on overlapping scopes from deadlocking.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct QuotaManager {
    inner: Arc<Inner>,
}

impl QuotaManager {
    /// Creates a builder for a manager of `schema`'s kind.
    pub fn builder(schema: Arc<QuotaSchema>) -> QuotaManagerBuilder {
        QuotaManagerBuilder {
            schema,
            limits: None,
            pending: None,
            usage: None,
            locks: None,
            directory: None,
            source: None,
            auto_provision: true,
            enforce: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            reconciler: ReconcilerConfig::default(),
        }
    }

    /// Returns the kind name.
    pub fn kind(&self) -> &str {
        self.inner.schema.name()
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<QuotaSchema> {
        &self.inner.schema
    }

    /// Returns the usage reconciler.
    pub fn reconciler(&self) -> &UsageReconciler {
        &self.inner.reconciler
    }

    fn validate_key(&self, key: &ScopeKey) -> Result<(), QuotaError> {
        if key.layer() != self.inner.schema.layer() {
            return Err(QuotaError::InvalidKey {
                reason: format!(
                    "'{}' quotas are keyed by '{}', got {}",
                    self.kind(),
                    self.inner.schema.layer(),
                    key
                ),
            });
        }
        Ok(())
    }

    fn validate(&self, quota: &Quota) -> Result<(), QuotaError> {
        if quota.kind() != self.kind() {
            return Err(QuotaError::KindMismatch {
                expected: self.kind().to_string(),
                actual: quota.kind().to_string(),
            });
        }
        self.validate_key(quota.key())
    }

    fn lock_name(&self, key: &ScopeKey) -> String {
        scope_lock_name(self.kind(), key)
    }

    async fn owner_exists(&self, key: &ScopeKey) -> Result<bool, QuotaError> {
        self.inner
            .directory
            .exists(key)
            .await
            .map_err(|source| StoreError::Backend { source }.into())
    }

    async fn lock_keys(&self, mut keys: Vec<ScopeKey>) -> Result<Vec<LockGuard>, QuotaError> {
        sort_by_specificity(&mut keys, |k| k);
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let guard = self
                .inner
                .locks
                .acquire(&self.lock_name(key), self.inner.lock_timeout)
                .await?;
            guards.push(guard);
        }
        Ok(guards)
    }

    async fn stored_ancestors(&self, key: &ScopeKey) -> Result<Vec<Quota>, QuotaError> {
        let mut ancestors = self
            .inner
            .limits
            .list(&self.inner.schema)
            .await?
            .into_iter()
            .filter(|row| row.key().contains(key))
            .collect::<Vec<_>>();
        sort_by_specificity(&mut ancestors, Quota::key);
        Ok(ancestors)
    }

    /// Locks `key` and every stored ancestor row.
    async fn lock_scope(&self, key: &ScopeKey) -> Result<Vec<LockGuard>, QuotaError> {
        let mut keys = self
            .stored_ancestors(key)
            .await?
            .into_iter()
            .map(|row| row.key().clone())
            .collect::<Vec<_>>();
        keys.push(key.clone());
        self.lock_keys(keys).await
    }

    async fn quota_for(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        let schema = &self.inner.schema;
        if let Some(quota) = self.inner.limits.get(schema, key).await? {
            return Ok(quota);
        }

        if !self.owner_exists(key).await? {
            return Err(QuotaError::NotFound { key: key.clone() });
        }

        // Only complete keys are persisted. A stored row binds every key within it, and defaults must not.
        let defaults = Quota::defaults(schema, key.clone());
        if !self.inner.auto_provision || !key.is_complete() {
            return Ok(defaults);
        }

        match self.inner.limits.set(&defaults).await {
            Ok(stored) => {
                debug!(kind = self.kind(), scope = %key, "Provisioned default quota.");
                Ok(stored)
            }
            // Provisioned concurrently.
            Err(StoreError::VersionConflict { .. }) => self
                .inner
                .limits
                .get(schema, key)
                .await?
                .ok_or_else(|| QuotaError::NotFound { key: key.clone() }),
            Err(e) => Err(e.into()),
        }
    }

    async fn persisted_usage(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        if let Some(usage) = self.inner.usage.get(&self.inner.schema, key).await? {
            return Ok(usage);
        }

        // Never reconciled: read ground truth directly and have the reconciler persist it.
        let usage = self
            .inner
            .source
            .fetch_usage(&self.inner.schema, key)
            .await
            .map_err(|source| StoreError::Backend { source })?;
        self.inner.reconciler.nudge(key);
        Ok(usage.with_key(key.clone()))
    }

    async fn pending_within(&self, key: &ScopeKey) -> Result<Vec<Quota>, QuotaError> {
        let mut pending = self
            .inner
            .pending
            .list(&self.inner.schema)
            .await?
            .into_iter()
            .filter(|p| p.key().is_within(key))
            .collect::<Vec<_>>();
        sort_by_specificity(&mut pending, Quota::key);
        Ok(pending)
    }

    /// Computes `usage + pending + delta` for the scope and every stored ancestor and compares it to their limits.
    ///
    /// Must be called with the scope locked.
    async fn evaluate(&self, delta: &Quota) -> Result<Quota, QuotaError> {
        let key = delta.key();
        let mut limits = self.stored_ancestors(key).await?;
        limits.push(self.quota_for(key).await?);

        let pending = self.inner.pending.list(&self.inner.schema).await?;

        let mut exceeded = Vec::new();
        let mut own_used = None;
        for limit in &limits {
            let mut used = self.persisted_usage(limit.key()).await?;
            for reservation in pending.iter().filter(|p| p.key().is_within(limit.key())) {
                used.add(reservation);
            }
            used.add(delta);

            exceeded.extend(used.exceed(limit));
            if limit.key() == key {
                own_used = Some(used);
            }
        }

        if !exceeded.is_empty() {
            if self.inner.enforce {
                return Err(QuotaError::OutOfQuota {
                    kind: self.kind().to_string(),
                    exceeded,
                });
            }
            warn!(kind = self.kind(), scope = %key, exceeded = exceeded.len(), "Quota exceeded but not enforced.");
        }

        Ok(own_used.unwrap_or_else(|| Quota::zero(&self.inner.schema, key.clone())))
    }

    async fn add_pending(&self, delta: &Quota) -> Result<(), QuotaError> {
        let schema = &self.inner.schema;
        let mut current = self
            .inner
            .pending
            .get(schema, delta.key())
            .await?
            .unwrap_or_else(|| Quota::zero(schema, delta.key().clone()));
        current.add(delta);
        self.inner.pending.set(&current).await?;
        Ok(())
    }

    async fn admit(&self, actor: &str, delta: &Quota, reserve: bool) -> Result<Quota, QuotaError> {
        self.validate(delta)?;

        let result: Result<Quota, QuotaError> = async {
            let _guards = self.lock_scope(delta.key()).await?;
            let used = self.evaluate(delta).await?;
            if reserve {
                self.add_pending(delta).await?;
            }
            Ok(used)
        }
        .await;

        let telemetry = &self.inner.telemetry;
        match &result {
            Ok(used) => {
                telemetry.admission_allowed.increment(1);
                if reserve {
                    telemetry.reservations.increment(1);
                }
                debug!(kind = self.kind(), scope = %delta.key(), actor, reserve, used = ?used, "Admitted.");
            }
            Err(e @ QuotaError::OutOfQuota { .. }) => {
                telemetry.admission_denied.increment(1);
                info!(kind = self.kind(), scope = %delta.key(), actor, error = %e, "Denied.");
            }
            Err(e) => {
                telemetry.admission_failed.increment(1);
                warn!(kind = self.kind(), scope = %delta.key(), actor, error = %e, "Admission check failed. Denying.");
            }
        }

        result
    }

    /// Returns the stored quota for `key`.
    ///
    /// A missing row is created from the system defaults when the owner exists. It is persisted when auto-provisioning
    /// is enabled and every field of `key` is populated. Defaults for more general keys are returned at version zero
    /// without being stored, so reading them never adds a limit over their descendants.
    ///
    /// # Errors
    ///
    /// If the owner of `key` does not exist, `NotFound` is returned.
    pub async fn get_quota(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        self.validate_key(key)?;
        self.quota_for(key).await
    }

    /// Returns the pending reservations stored at exactly `key`, or zero.
    pub async fn get_pending_usage(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        self.validate_key(key)?;
        let schema = &self.inner.schema;
        Ok(self
            .inner
            .pending
            .get(schema, key)
            .await?
            .unwrap_or_else(|| Quota::zero(schema, key.clone())))
    }

    /// Returns the persisted usage of `key`, or zero.
    pub async fn get_usage(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        self.validate_key(key)?;
        let schema = &self.inner.schema;
        Ok(self
            .inner
            .usage
            .get(schema, key)
            .await?
            .unwrap_or_else(|| Quota::zero(schema, key.clone())))
    }

    /// Overwrites the stored limits of `quota`'s scope.
    ///
    /// The quota's version must match the stored row (zero for a new row).
    ///
    /// # Errors
    ///
    /// If the row changed since it was read, a version conflict is returned.
    pub async fn set_quota(&self, actor: &str, quota: &Quota) -> Result<Quota, QuotaError> {
        self.validate(quota)?;
        let _guards = self.lock_scope(quota.key()).await?;

        let stored = self.inner.limits.set(quota).await?;
        info!(kind = self.kind(), scope = %quota.key(), actor, version = stored.version(), "Set quota.");
        Ok(stored)
    }

    /// Applies an administrative action to the stored limits of `key`.
    pub async fn apply_action(
        &self, actor: &str, key: &ScopeKey, action: QuotaAction, update: &QuotaUpdate,
    ) -> Result<Quota, QuotaError> {
        self.validate_key(key)?;
        let _guards = self.lock_scope(key).await?;

        let mut quota = self.quota_for(key).await?;
        quota.apply(action, update)?;
        let stored = self.inner.limits.set(&quota).await?;
        info!(kind = self.kind(), scope = %key, actor, ?action, version = stored.version(), "Updated quota.");
        Ok(stored)
    }

    /// Deletes the limits, reservations and usage of `key`.
    ///
    /// # Errors
    ///
    /// Base keys, with only domain and project set, cannot be deleted. If there is no stored row, `NotFound` is
    /// returned.
    pub async fn delete_quota(&self, actor: &str, key: &ScopeKey) -> Result<(), QuotaError> {
        self.validate_key(key)?;
        if key.is_base() {
            return Err(QuotaError::Forbidden {
                key: key.clone(),
                reason: "domain and project quotas can only be reset".to_string(),
            });
        }

        let _guards = self.lock_scope(key).await?;
        let schema = &self.inner.schema;
        if !self.inner.limits.delete(schema, key).await? {
            return Err(QuotaError::NotFound { key: key.clone() });
        }
        self.inner.pending.delete(schema, key).await?;
        self.inner.usage.delete(schema, key).await?;

        info!(kind = self.kind(), scope = %key, actor, "Deleted quota.");
        Ok(())
    }

    /// Checks whether `delta` fits within the limits of its scope and every stored ancestor.
    ///
    /// Returns the scope's usage including pending reservations and `delta`.
    ///
    /// # Errors
    ///
    /// If any limit would be exceeded, an out-of-quota error listing every exceeded field is returned. Lock and store
    /// failures are returned as-is and must be treated as a denial.
    pub async fn check_quota(&self, actor: &str, delta: &Quota) -> Result<Quota, QuotaError> {
        self.admit(actor, delta, false).await
    }

    /// Checks `delta` and, if it fits, adds it to the pending reservations, under one lock acquisition.
    pub async fn check_set_pending_quota(&self, actor: &str, delta: &Quota) -> Result<Quota, QuotaError> {
        self.admit(actor, delta, true).await
    }

    /// Reserves `delta` and records the reservation in `pending`.
    pub async fn reserve(&self, actor: &str, pending: &mut PendingUsages, delta: &Quota) -> Result<Quota, QuotaError> {
        let used = self.check_set_pending_quota(actor, delta).await?;
        pending.save([delta.clone()]);
        Ok(used)
    }

    /// Releases a reservation.
    ///
    /// `cancel` is subtracted from the pending reservations of its scope. With `save` set, the reservation is being
    /// confirmed rather than rolled back: `cancel` is also subtracted from `local`, if given, and a usage recompute is
    /// requested so ground truth takes over from the reservation.
    pub async fn cancel_pending_usage(
        &self, actor: &str, local: Option<&mut Quota>, cancel: &Quota, save: bool,
    ) -> Result<(), QuotaError> {
        self.validate(cancel)?;
        if let Some(local) = local.as_deref() {
            self.validate(local)?;
        }

        let key = cancel.key();
        {
            let _guards = self.lock_scope(key).await?;
            let schema = &self.inner.schema;
            match self.inner.pending.get(schema, key).await? {
                Some(mut current) => {
                    current.sub(cancel);
                    if current.is_empty() {
                        self.inner.pending.delete(schema, key).await?;
                    } else {
                        self.inner.pending.set(&current).await?;
                    }
                }
                None => warn!(kind = self.kind(), scope = %key, actor, "No pending usage to cancel."),
            }
        }
        self.inner.telemetry.cancellations.increment(1);
        debug!(kind = self.kind(), scope = %key, actor, save, "Cancelled pending usage.");

        if save {
            if let Some(local) = local {
                local.sub(cancel);
            }
            self.inner.reconciler.request_recompute(key).await?;
        }

        Ok(())
    }

    /// Removes every pending reservation at or below `key`, returning how many rows were removed.
    pub async fn clean_pending_usage(&self, actor: &str, key: &ScopeKey) -> Result<usize, QuotaError> {
        self.validate_key(key)?;

        let rows = self.pending_within(key).await?;
        let mut keys = self
            .stored_ancestors(key)
            .await?
            .into_iter()
            .map(|row| row.key().clone())
            .collect::<Vec<_>>();
        keys.push(key.clone());
        keys.extend(rows.iter().map(|row| row.key().clone()));
        let _guards = self.lock_keys(keys).await?;

        let mut removed = 0;
        for row in &rows {
            if self.inner.pending.delete(&self.inner.schema, row.key()).await? {
                removed += 1;
            }
        }

        info!(kind = self.kind(), scope = %key, actor, removed, "Cleaned pending usage.");
        Ok(removed)
    }

    /// Returns limits, usage and pending reservations of `key`.
    ///
    /// With `refresh`, usage is recomputed from ground truth first.
    pub async fn describe(&self, key: &ScopeKey, refresh: bool) -> Result<QuotaReport, QuotaError> {
        self.validate_key(key)?;

        let quota = self.quota_for(key).await?;
        let usage = if refresh {
            self.inner.reconciler.recompute(key).await?
        } else {
            self.get_usage(key).await?
        };
        let pending = self.pending_within(key).await?;

        Ok(QuotaReport { quota, usage, pending })
    }

    async fn prune(&self, key: &ScopeKey) -> Result<(), QuotaError> {
        let _guards = self.lock_scope(key).await?;
        let schema = &self.inner.schema;
        self.inner.limits.delete(schema, key).await?;
        self.inner.pending.delete(schema, key).await?;
        self.inner.usage.delete(schema, key).await?;

        self.inner.telemetry.rows_pruned.increment(1);
        info!(kind = self.kind(), scope = %key, "Pruned quota of a removed owner.");
        Ok(())
    }

    /// Lists stored rows matching `filter`, most general first.
    ///
    /// Rows whose owner no longer exists are deleted instead of listed.
    pub async fn list_quotas(&self, filter: &QuotaListFilter) -> Result<Vec<QuotaReport>, QuotaError> {
        let rows = self.inner.limits.list(&self.inner.schema).await?;
        let keys = rows.iter().map(|row| row.key().clone()).collect::<Vec<_>>();
        let known = self
            .inner
            .directory
            .known_owners(&keys)
            .await
            .map_err(|source| QuotaError::from(StoreError::Backend { source }))?;

        let mut reports = Vec::new();
        for (quota, exists) in rows.into_iter().zip(known) {
            let key = quota.key().clone();
            if !exists {
                self.prune(&key).await?;
                continue;
            }
            if !filter.matches(&key) {
                continue;
            }

            reports.push(QuotaReport {
                usage: self.get_usage(&key).await?,
                pending: self.pending_within(&key).await?,
                quota,
            });
        }

        sort_by_specificity(&mut reports, |r| r.quota.key());
        Ok(reports)
    }

    /// Marks the usage of `key` stale and queues a recompute.
    pub async fn request_recompute(&self, key: &ScopeKey) -> Result<bool, QuotaError> {
        self.validate_key(key)?;
        self.inner.reconciler.request_recompute(key).await
    }

    /// Recomputes the usage of `key` and waits for the result.
    pub async fn recompute_usage(&self, key: &ScopeKey) -> Result<Quota, QuotaError> {
        self.validate_key(key)?;
        self.inner.reconciler.recompute(key).await
    }

    /// Removes pending reservations whose rows were last changed at or before `cutoff`, returning how many rows were
    /// removed.
    ///
    /// Reservations are released through [`cancel_pending_usage`][Self::cancel_pending_usage] or absorbed by usage
    /// recomputes. A row that has not changed since `cutoff` belongs to workflows that never did either. The
    /// reconciler's periodic sweep calls this with `quota.reconcile.pending_ttl_secs` as the age.
    pub async fn expire_pending_usage(&self, cutoff: DateTime<Utc>) -> Result<usize, QuotaError> {
        self.inner.reconciler.expire_pending(cutoff).await
    }

    /// Queues a recompute for every stored row, returning how many scopes were queued.
    pub async fn sweep(&self) -> Result<usize, QuotaError> {
        let rows = self.inner.limits.list(&self.inner.schema).await?;
        let mut queued = 0;
        for row in &rows {
            if self.inner.reconciler.request_recompute(row.key()).await? {
                queued += 1;
            }
        }
        debug!(kind = self.kind(), rows = rows.len(), queued, "Requested usage sweep.");
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        quota::QuotaField,
        scope::{KeyLayer, PROVIDER, REGION_ID},
        test_util::{compute_schema, cpu, d1_t1, FailingStore},
        usage::StaticDirectory,
    };

    struct Harness {
        manager: QuotaManager,
        limits: Arc<dyn QuotaStore>,
        pending: Arc<dyn QuotaStore>,
        usage: Arc<dyn QuotaStore>,
    }

    fn harness(builder: QuotaManagerBuilder) -> Harness {
        let limits: Arc<dyn QuotaStore> = Arc::new(TableStore::new());
        let pending: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
        let usage: Arc<dyn QuotaStore> = Arc::new(TableStore::new());
        let manager = builder
            .limit_store(Arc::clone(&limits))
            .pending_store(Arc::clone(&pending))
            .usage_store(Arc::clone(&usage))
            .build();

        Harness {
            manager,
            limits,
            pending,
            usage,
        }
    }

    async fn seed(store: &Arc<dyn QuotaStore>, quota: Quota) {
        store.set(&quota).await.unwrap();
    }

    // Limit 10 cpu, 4 in use and 2 pending.
    async fn scenario() -> Harness {
        let h = harness(QuotaManager::builder(compute_schema()));
        seed(&h.limits, cpu(d1_t1(), 10)).await;
        seed(&h.usage, cpu(d1_t1(), 4)).await;
        seed(&h.pending, cpu(d1_t1(), 2)).await;
        h
    }

    #[tokio::test]
    async fn get_quota_provisions_defaults() {
        let h = harness(QuotaManager::builder(compute_schema()));

        let quota = h.manager.get_quota(&d1_t1()).await.unwrap();
        assert_eq!(quota.values(), &[10, 1024]);
        assert_eq!(quota.version(), 1);
        assert!(h.limits.get(&compute_schema(), &d1_t1()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_quota_without_auto_provision_does_not_persist() {
        let h = harness(QuotaManager::builder(compute_schema()).auto_provision(false));

        let quota = h.manager.get_quota(&d1_t1()).await.unwrap();
        assert_eq!(quota.values(), &[10, 1024]);
        assert_eq!(quota.version(), 0);
        assert!(h.limits.get(&compute_schema(), &d1_t1()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_owner_is_not_found() {
        let directory = Arc::new(StaticDirectory::new());
        directory.add_project("d1", "t1");
        let h = harness(QuotaManager::builder(compute_schema()).directory(directory));

        let err = h.manager.get_quota(&ScopeKey::project("d1", "t9")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = h.manager.check_quota("alice", &cpu(ScopeKey::project("d1", "t9"), 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn wrong_kind_or_layer_rejected() {
        let h = harness(QuotaManager::builder(compute_schema()));
        let storage = QuotaSchema::new("storage", KeyLayer::Project, vec![QuotaField::new("disk", 1)]);

        let err = h.manager.check_quota("alice", &Quota::zero(&storage, d1_t1())).await.unwrap_err();
        assert!(matches!(err, QuotaError::KindMismatch { .. }));

        let err = h.manager.get_usage(&ScopeKey::domain("d1")).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn check_adds_usage_pending_and_delta() {
        let h = scenario().await;

        let used = h.manager.check_quota("alice", &cpu(d1_t1(), 3)).await.unwrap();
        assert_eq!(used.get("cpu"), Some(9));

        // A check does not reserve anything.
        assert_eq!(h.manager.get_pending_usage(&d1_t1()).await.unwrap().get("cpu"), Some(2));
    }

    #[tokio::test]
    async fn second_delta_denied_after_first_is_reserved() {
        let h = scenario().await;

        h.manager.check_set_pending_quota("alice", &cpu(d1_t1(), 3)).await.unwrap();
        let err = h.manager.check_quota("bob", &cpu(d1_t1(), 2)).await.unwrap_err();

        let exceeded = err.exceeded().unwrap();
        assert_eq!(exceeded.len(), 1);
        assert_eq!(exceeded[0].field, "cpu");
        assert_eq!(exceeded[0].scope, d1_t1());
        assert_eq!((exceeded[0].limit, exceeded[0].used), (10, 11));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("cpu"));
    }

    #[tokio::test]
    async fn denial_reports_every_field() {
        let h = scenario().await;

        let delta = Quota::from_pairs(&compute_schema(), d1_t1(), [("cpu", 5), ("memory", 2048)]).unwrap();
        let err = h.manager.check_quota("alice", &delta).await.unwrap_err();
        let fields = err.exceeded().unwrap().iter().map(|e| e.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["cpu", "memory"]);
    }

    #[tokio::test]
    async fn admission_is_monotonic_in_delta() {
        let h = scenario().await;

        for smaller in 0..8 {
            let small = h.manager.check_quota("alice", &cpu(d1_t1(), smaller)).await;
            if small.is_err() {
                for larger in smaller..12 {
                    let err = h.manager.check_quota("alice", &cpu(d1_t1(), larger)).await.unwrap_err();
                    assert!(err.exceeded().unwrap().iter().any(|e| e.field == "cpu"));
                }
            }
        }
    }

    #[tokio::test]
    async fn reserve_then_cancel_is_identity() {
        let h = scenario().await;
        let before = h.manager.get_pending_usage(&d1_t1()).await.unwrap();

        let delta = cpu(d1_t1(), 3);
        let mut pending = PendingUsages::new();
        h.manager.reserve("alice", &mut pending, &delta).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(h.manager.get_pending_usage(&d1_t1()).await.unwrap().get("cpu"), Some(5));

        h.manager.cancel_pending_usage("alice", None, &delta, false).await.unwrap();
        pending.clear();
        assert_eq!(h.manager.get_pending_usage(&d1_t1()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn confirm_releases_local_and_recomputes() {
        let source = Arc::new(StaticUsageSource::new());
        source.record("compute", d1_t1(), [("cpu", 7)]);
        let builder = QuotaManager::builder(compute_schema()).usage_source(Arc::clone(&source) as Arc<dyn UsageSource>);
        let h = harness(builder);

        let delta = cpu(d1_t1(), 3);
        h.manager.check_set_pending_quota("alice", &delta).await.unwrap();

        let mut local = cpu(d1_t1(), 5);
        h.manager.cancel_pending_usage("alice", Some(&mut local), &delta, true).await.unwrap();
        assert_eq!(local.get("cpu"), Some(2));
        assert!(h.manager.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
        assert!(h.pending.get(&compute_schema(), &d1_t1()).await.unwrap().is_none());

        let usage = h.manager.recompute_usage(&d1_t1()).await.unwrap();
        assert_eq!(usage.get("cpu"), Some(7));
        assert_eq!(h.manager.get_usage(&d1_t1()).await.unwrap().get("cpu"), Some(7));
    }

    #[tokio::test]
    async fn ancestor_limits_bound_descendants() {
        let schema = QuotaSchema::new("region", KeyLayer::ProjectRegion, vec![QuotaField::new("eip", 10)]);
        let h = harness(QuotaManager::builder(Arc::clone(&schema)));

        let base = ScopeKey::system(KeyLayer::ProjectRegion);
        let domain = base.clone().with("domain_id", "d1").unwrap();
        let in_project = |tenant: &str| {
            domain
                .clone()
                .with("tenant_id", tenant)
                .and_then(|k| k.with(PROVIDER, "aws"))
                .and_then(|k| k.with(REGION_ID, "r1"))
                .unwrap()
        };
        let eip = |key: ScopeKey, n: u64| Quota::from_pairs(&schema, key, [("eip", n)]).unwrap();

        seed(&h.limits, eip(domain.clone(), 3)).await;

        h.manager.check_set_pending_quota("alice", &eip(in_project("t1"), 2)).await.unwrap();
        h.manager.check_set_pending_quota("bob", &eip(in_project("t2"), 1)).await.unwrap();

        let err = h.manager.check_quota("alice", &eip(in_project("t1"), 1)).await.unwrap_err();
        let exceeded = err.exceeded().unwrap();
        assert_eq!(exceeded.len(), 1);
        assert_eq!(exceeded[0].scope, domain);
        assert_eq!((exceeded[0].limit, exceeded[0].used), (3, 4));

        // The project rows themselves fall back to defaults.
        assert_eq!(h.manager.get_quota(&in_project("t1")).await.unwrap().get("eip"), Some(10));
    }

    #[tokio::test]
    async fn reading_general_scopes_does_not_add_limits() {
        let source = Arc::new(StaticUsageSource::new());
        source.record("compute", d1_t1(), [("cpu", 4)]);
        source.record("compute", ScopeKey::project("d1", "t2"), [("cpu", 8)]);
        let h = harness(QuotaManager::builder(compute_schema()).usage_source(source as Arc<dyn UsageSource>));

        let used = h.manager.check_quota("alice", &cpu(d1_t1(), 1)).await.unwrap();
        assert_eq!(used.get("cpu"), Some(5));

        let system = ScopeKey::system(KeyLayer::Project);
        let report = h.manager.describe(&system, false).await.unwrap();
        assert_eq!(report.quota.version(), 0);
        let domain = ScopeKey::project("d1", "");
        assert_eq!(h.manager.get_quota(&domain).await.unwrap().version(), 0);
        assert!(h.limits.get(&compute_schema(), &system).await.unwrap().is_none());
        assert!(h.limits.get(&compute_schema(), &domain).await.unwrap().is_none());

        let used = h.manager.check_quota("alice", &cpu(d1_t1(), 1)).await.unwrap();
        assert_eq!(used.get("cpu"), Some(5));

        // A check on the general scope compares against its defaults without storing them.
        let err = h.manager.check_quota("alice", &cpu(domain.clone(), 1)).await.unwrap_err();
        assert_eq!(err.exceeded().unwrap()[0].scope, domain);
        assert!(h.limits.get(&compute_schema(), &domain).await.unwrap().is_none());
        h.manager.check_quota("alice", &cpu(d1_t1(), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_reservations_expire() {
        let h = harness(QuotaManager::builder(compute_schema()));

        {
            let mut pending = PendingUsages::new();
            h.manager.reserve("alice", &mut pending, &cpu(d1_t1(), 8)).await.unwrap();
        }
        h.manager.recompute_usage(&d1_t1()).await.unwrap();
        let err = h.manager.check_quota("bob", &cpu(d1_t1(), 3)).await.unwrap_err();
        assert_eq!(err.exceeded().unwrap()[0].used, 11);

        // Rows changed after the cutoff are kept.
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(h.manager.expire_pending_usage(earlier).await.unwrap(), 0);

        assert_eq!(h.manager.expire_pending_usage(Utc::now()).await.unwrap(), 1);
        assert!(h.manager.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
        let used = h.manager.check_quota("bob", &cpu(d1_t1(), 3)).await.unwrap();
        assert_eq!(used.get("cpu"), Some(3));

        // A late cancel of the expired reservation is harmless.
        h.manager.cancel_pending_usage("alice", None, &cpu(d1_t1(), 8), false).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_enforcement_admits() {
        let h = harness(QuotaManager::builder(compute_schema()).enforce(false));
        seed(&h.limits, cpu(d1_t1(), 1)).await;

        let used = h.manager.check_set_pending_quota("alice", &cpu(d1_t1(), 5)).await.unwrap();
        assert_eq!(used.get("cpu"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_timeout_fails_closed() {
        let locks = Arc::new(LocalLockCoordinator::new());
        let h = harness(
            QuotaManager::builder(compute_schema())
                .lock_coordinator(Arc::clone(&locks) as Arc<dyn LockCoordinator>)
                .lock_timeout(Duration::from_millis(100)),
        );

        let _held = locks
            .acquire(&format!("compute/{}", d1_t1()), Duration::from_secs(1))
            .await
            .unwrap();

        let err = h
            .manager
            .check_set_pending_quota("alice", &cpu(d1_t1(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(h.manager.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let pending = Arc::new(FailingStore::default());
        let h = harness(QuotaManager::builder(compute_schema()));
        let manager = QuotaManager::builder(compute_schema())
            .limit_store(Arc::clone(&h.limits))
            .pending_store(Arc::clone(&pending) as Arc<dyn QuotaStore>)
            .build();

        pending.set_failing(true);
        let err = manager.check_set_pending_quota("alice", &cpu(d1_t1(), 1)).await.unwrap_err();
        assert!(matches!(err, QuotaError::Store { .. }));
        assert!(err.is_retryable());

        pending.set_failing(false);
        manager.check_set_pending_quota("alice", &cpu(d1_t1(), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn set_quota_detects_concurrent_writes() {
        let h = harness(QuotaManager::builder(compute_schema()));
        let current = h.manager.get_quota(&d1_t1()).await.unwrap();

        let mut first = current.clone();
        first.set("cpu", 20).unwrap();
        let stored = h.manager.set_quota("alice", &first).await.unwrap();
        assert_eq!(stored.version(), current.version() + 1);

        let mut stale = current;
        stale.set("cpu", 30).unwrap();
        let err = h.manager.set_quota("bob", &stale).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Store {
                source: StoreError::VersionConflict { .. }
            }
        ));
        assert_eq!(h.manager.get_quota(&d1_t1()).await.unwrap().get("cpu"), Some(20));
    }

    #[tokio::test]
    async fn apply_action_merges_over_stored_quota() {
        let h = harness(QuotaManager::builder(compute_schema()));

        let update = QuotaUpdate::new().with("cpu", 32);
        let stored = h
            .manager
            .apply_action("admin", &d1_t1(), QuotaAction::Update, &update)
            .await
            .unwrap();
        assert_eq!(stored.values(), &[32, 1024]);

        let stored = h
            .manager
            .apply_action("admin", &d1_t1(), QuotaAction::Reset, &QuotaUpdate::new())
            .await
            .unwrap();
        assert_eq!(stored.values(), &[10, 1024]);
    }

    #[tokio::test]
    async fn delete_rules() {
        let schema = QuotaSchema::new("region", KeyLayer::ProjectRegion, vec![QuotaField::new("eip", 10)]);
        let h = harness(QuotaManager::builder(Arc::clone(&schema)));
        let project =
            ScopeKey::from_pairs(KeyLayer::ProjectRegion, [("domain_id", "d1"), ("tenant_id", "t1")]).unwrap();
        let region = project.clone().with(REGION_ID, "r1").unwrap();

        let err = h.manager.delete_quota("admin", &project).await.unwrap_err();
        assert!(matches!(err, QuotaError::Forbidden { .. }));

        let err = h.manager.delete_quota("admin", &region).await.unwrap_err();
        assert!(err.is_not_found());

        h.manager
            .set_quota("admin", &Quota::from_pairs(&schema, region.clone(), [("eip", 5)]).unwrap())
            .await
            .unwrap();
        h.manager
            .check_set_pending_quota("alice", &Quota::from_pairs(&schema, region.clone(), [("eip", 1)]).unwrap())
            .await
            .unwrap();
        h.manager.delete_quota("admin", &region).await.unwrap();
        assert!(h.limits.get(&schema, &region).await.unwrap().is_none());
        assert!(h.pending.get(&schema, &region).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_pending_removes_rows_below_scope() {
        let h = harness(QuotaManager::builder(compute_schema()));
        h.manager.check_set_pending_quota("alice", &cpu(d1_t1(), 1)).await.unwrap();
        h.manager
            .check_set_pending_quota("alice", &cpu(ScopeKey::project("d1", "t2"), 1))
            .await
            .unwrap();
        h.manager
            .check_set_pending_quota("alice", &cpu(ScopeKey::project("d2", "t1"), 1))
            .await
            .unwrap();

        let removed = h.manager.clean_pending_usage("admin", &ScopeKey::project("d1", "")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(h.pending.list(&compute_schema()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn describe_merges_report() {
        let h = scenario().await;

        let report = h.manager.describe(&d1_t1(), false).await.unwrap();
        assert_eq!(
            report.to_json(),
            json!({
                "domain_id": "d1",
                "tenant_id": "t1",
                "cpu": 10,
                "memory": 0,
                "usage.cpu": 4,
                "usage.memory": 0,
                "pending": [{"domain_id": "d1", "tenant_id": "t1", "cpu": 2, "memory": 0}]
            })
        );
        assert!((report.usage_rate() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_rate_skips_zero_limits() {
        let quota = Quota::from_pairs(&compute_schema(), d1_t1(), [("cpu", 0), ("memory", 100)]).unwrap();
        let usage = Quota::from_pairs(&compute_schema(), d1_t1(), [("cpu", 5), ("memory", 25)]).unwrap();
        let report = QuotaReport {
            quota,
            usage,
            pending: Vec::new(),
        };
        assert!((report.usage_rate() - 0.25).abs() < f64::EPSILON);

        let unlimited = QuotaReport {
            quota: Quota::zero(&compute_schema(), d1_t1()),
            ..report
        };
        assert_eq!(unlimited.usage_rate(), 0.0);
    }

    #[tokio::test]
    async fn list_filters_prunes_and_sorts() {
        let directory = Arc::new(StaticDirectory::new());
        directory.add_project("d1", "t1");
        directory.add_project("d1", "t2");
        let builder =
            QuotaManager::builder(compute_schema()).directory(Arc::clone(&directory) as Arc<dyn ScopeDirectory>);
        let h = harness(builder);

        seed(&h.limits, cpu(d1_t1(), 10)).await;
        seed(&h.limits, cpu(ScopeKey::project("d1", "t2"), 10)).await;
        seed(&h.limits, cpu(ScopeKey::project("d1", ""), 100)).await;
        seed(&h.limits, cpu(ScopeKey::project("d9", "t9"), 10)).await;
        seed(&h.usage, cpu(d1_t1(), 2)).await;
        seed(&h.usage, cpu(ScopeKey::project("d1", "t2"), 9)).await;

        let mut reports = h.manager.list_quotas(&QuotaListFilter::default()).await.unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].quota.key(), &ScopeKey::project("d1", ""));
        assert!(h.limits.get(&compute_schema(), &ScopeKey::project("d9", "t9")).await.unwrap().is_none());

        sort_by_usage_rate(&mut reports);
        assert_eq!(reports[0].quota.key(), &ScopeKey::project("d1", "t2"));

        let filter = QuotaListFilter {
            domain_only: true,
            ..Default::default()
        };
        let reports = h.manager.list_quotas(&filter).await.unwrap();
        assert_eq!(reports.len(), 1);

        let filter = QuotaListFilter {
            tenant_id: Some("t1".to_string()),
            ..Default::default()
        };
        let reports = h.manager.list_quotas(&filter).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].quota.key(), &d1_t1());
    }

    #[tokio::test]
    async fn sweep_queues_every_row() {
        let source = Arc::new(StaticUsageSource::new());
        source.record("compute", d1_t1(), [("cpu", 3)]);
        let builder = QuotaManager::builder(compute_schema()).usage_source(Arc::clone(&source) as Arc<dyn UsageSource>);
        let h = harness(builder);
        seed(&h.limits, cpu(d1_t1(), 10)).await;
        seed(&h.limits, cpu(ScopeKey::project("d1", "t2"), 10)).await;

        assert_eq!(h.manager.sweep().await.unwrap(), 2);

        // The worker handles jobs in order, so a synchronous recompute queued last sees earlier jobs done.
        h.manager.recompute_usage(&ScopeKey::project("d1", "t2")).await.unwrap();
        assert_eq!(h.manager.get_usage(&d1_t1()).await.unwrap().get("cpu"), Some(3));
        assert!(!h.manager.reconciler().is_dirty(&d1_t1()));
    }
}
