//! Quota persistence.
//!
//! A manager composes three stores: limits, pending reservations and persisted usage. Every store implements
//! [`QuotaStore`], so any of them can be backed by memory, project metadata or a table.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    error::StoreError,
    quota::{Quota, QuotaSchema},
    scope::ScopeKey,
};

mod memory;
pub use self::memory::MemoryStore;

mod metadata;
pub use self::metadata::MetadataStore;

mod table;
pub use self::table::TableStore;

/// Persists quota rows of one or more kinds.
///
/// Rows carry a version. [`set`][QuotaStore::set] only succeeds when the given quota's version matches the stored
/// one (zero for a row that does not exist yet), and bumps it by one.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Reads the row of `schema`'s kind for `key`.
    async fn get(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Option<Quota>, StoreError>;

    /// Writes `quota`, returning the stored row with its new version.
    async fn set(&self, quota: &Quota) -> Result<Quota, StoreError>;

    /// Deletes the row of `schema`'s kind for `key`, returning `true` if it existed.
    async fn delete(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<bool, StoreError>;

    /// Lists every row of `schema`'s kind.
    async fn list(&self, schema: &Arc<QuotaSchema>) -> Result<Vec<Quota>, StoreError>;
}

/// Checks `quota`'s version against the stored version and returns the row to store.
fn next_version(quota: &Quota, stored: Option<u64>) -> Result<Quota, StoreError> {
    let current = stored.unwrap_or(0);
    if quota.version() != current {
        return Err(StoreError::VersionConflict {
            key: quota.key().key_string(),
            expected: quota.version(),
            actual: current,
        });
    }

    Ok(quota.clone().stored(current + 1, Utc::now()))
}

/// Overwrites a row whatever its version, for writers that are already serialized.
pub(crate) async fn overwrite(store: &dyn QuotaStore, quota: Quota) -> Result<Quota, StoreError> {
    let version = store
        .get(quota.schema(), quota.key())
        .await?
        .map(|current| current.version())
        .unwrap_or(0);
    let updated_at = quota.updated_at();
    store.set(&quota.with_version(version, updated_at)).await
}
