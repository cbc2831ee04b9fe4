use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{next_version, QuotaStore};
use crate::{
    error::StoreError,
    quota::{Quota, QuotaSchema},
    scope::ScopeKey,
};

/// Row address: the kind's table plus the `(domain_id, tenant_id, platform)` tuple.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct RowId {
    kind: String,
    domain_id: String,
    tenant_id: String,
    platform: String,
}

impl RowId {
    fn new(kind: &str, key: &ScopeKey) -> Self {
        Self {
            kind: kind.to_string(),
            domain_id: key.domain_id().unwrap_or_default().to_string(),
            tenant_id: key.tenant_id().unwrap_or_default().to_string(),
            platform: key.platform(),
        }
    }
}

struct TableRow {
    key: ScopeKey,
    columns: BTreeMap<String, u64>,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl TableRow {
    fn from_quota(quota: &Quota) -> Self {
        Self {
            key: quota.key().clone(),
            columns: quota
                .schema()
                .fields()
                .iter()
                .zip(quota.values())
                .map(|(field, value)| (field.name.clone(), *value))
                .collect(),
            version: quota.version(),
            updated_at: quota.updated_at(),
        }
    }

    // Columns the schema no longer has are dropped, new schema fields read as zero.
    fn to_quota(&self, schema: &Arc<QuotaSchema>) -> Quota {
        let mut quota = Quota::zero(schema, self.key.clone());
        for (column, value) in &self.columns {
            if schema.field_index(column).is_some() {
                let _ = quota.set(column, *value);
            }
        }
        quota.with_version(self.version, self.updated_at)
    }
}

/// Relational-style store.
///
/// Rows are addressed by `(domain_id, tenant_id, platform)` within a per-kind table, and hold one column per quota
/// field.
#[derive(Default)]
pub struct TableStore {
    rows: Mutex<BTreeMap<RowId, TableRow>>,
}

impl TableStore {
    /// Creates an empty `TableStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for TableStore {
    async fn get(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Option<Quota>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&RowId::new(schema.name(), key)).map(|row| row.to_quota(schema)))
    }

    async fn set(&self, quota: &Quota) -> Result<Quota, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let id = RowId::new(quota.kind(), quota.key());
        let stored = next_version(quota, rows.get(&id).map(|row| row.version))?;
        rows.insert(id, TableRow::from_quota(&stored));
        Ok(stored)
    }

    async fn delete(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.remove(&RowId::new(schema.name(), key)).is_some())
    }

    async fn list(&self, schema: &Arc<QuotaSchema>) -> Result<Vec<Quota>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(id, _)| id.kind == schema.name())
            .map(|(_, row)| row.to_quota(schema))
            .collect())
    }
}
