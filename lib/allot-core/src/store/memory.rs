use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{next_version, QuotaStore};
use crate::{
    error::StoreError,
    quota::{Quota, QuotaSchema},
    scope::ScopeKey,
};

/// Ephemeral in-memory store.
///
/// Used for pending reservations, which do not need to outlive the process, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, ScopeKey), Quota>>,
}

impl MemoryStore {
    /// Creates an empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Option<Quota>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&(schema.name().to_string(), key.clone())).cloned())
    }

    async fn set(&self, quota: &Quota) -> Result<Quota, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let id = (quota.kind().to_string(), quota.key().clone());
        let stored = next_version(quota, rows.get(&id).map(Quota::version))?;
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.remove(&(schema.name().to_string(), key.clone())).is_some())
    }

    async fn list(&self, schema: &Arc<QuotaSchema>) -> Result<Vec<Quota>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|((kind, _), _)| kind == schema.name())
            .map(|(_, quota)| quota.clone())
            .collect())
    }
}
