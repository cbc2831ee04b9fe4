use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc,
};

use allot_error::generic_error;
use async_trait::async_trait;

use crate::{
    error::StoreError,
    quota::{Quota, QuotaField, QuotaSchema},
    scope::{KeyLayer, ScopeKey},
    store::{MemoryStore, QuotaStore},
};

/// `compute` kind keyed by project: `cpu` defaults to 10, `memory` to 1024.
pub fn compute_schema() -> Arc<QuotaSchema> {
    QuotaSchema::new(
        "compute",
        KeyLayer::Project,
        vec![QuotaField::new("cpu", 10), QuotaField::new("memory", 1024)],
    )
}

pub fn d1_t1() -> ScopeKey {
    ScopeKey::project("d1", "t1")
}

pub fn cpu(key: ScopeKey, cpu: u64) -> Quota {
    Quota::from_pairs(&compute_schema(), key, [("cpu", cpu)]).unwrap()
}

/// Memory store that fails every call while `failing` is set.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(SeqCst) {
            Err(StoreError::Backend {
                source: generic_error!("connection reset"),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QuotaStore for FailingStore {
    async fn get(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Option<Quota>, StoreError> {
        self.check()?;
        self.inner.get(schema, key).await
    }

    async fn set(&self, quota: &Quota) -> Result<Quota, StoreError> {
        self.check()?;
        self.inner.set(quota).await
    }

    async fn delete(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete(schema, key).await
    }

    async fn list(&self, schema: &Arc<QuotaSchema>) -> Result<Vec<Quota>, StoreError> {
        self.check()?;
        self.inner.list(schema).await
    }
}
