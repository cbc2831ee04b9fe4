use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use allot_error::generic_error;
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Map, Value};

use super::{next_version, QuotaStore};
use crate::{
    error::StoreError,
    quota::{Quota, QuotaSchema},
    scope::{ScopeKey, DOMAIN_ID, TENANT_ID},
};

const QUOTA_PREFIX: &str = "quota";
const VERSION_MEMBER: &str = "meta.version";
const UPDATED_AT_MEMBER: &str = "meta.updated_at";

type Owner = (String, String);

/// Stores quotas as JSON blobs in the metadata of the owning domain or project.
///
/// Each owner has one metadata map with one member per quota kind. Only base keys can be stored, since there is
/// nowhere to put the platform fields.
#[derive(Default)]
pub struct MetadataStore {
    owners: Mutex<HashMap<Owner, Map<String, Value>>>,
}

impl MetadataStore {
    /// Creates an empty `MetadataStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw metadata blob of an owner, if any.
    pub fn metadata(&self, domain_id: &str, tenant_id: &str) -> Option<Value> {
        let owners = self.owners.lock().unwrap();
        owners
            .get(&(domain_id.to_string(), tenant_id.to_string()))
            .map(|blob| Value::Object(blob.clone()))
    }
}

fn owner_of(key: &ScopeKey) -> Result<Owner, StoreError> {
    if !key.is_base() {
        return Err(StoreError::Backend {
            source: generic_error!("metadata store only holds domain and project quotas, got {}", key),
        });
    }

    Ok((
        key.domain_id().unwrap_or_default().to_string(),
        key.tenant_id().unwrap_or_default().to_string(),
    ))
}

fn key_of(schema: &QuotaSchema, owner: &Owner) -> Result<ScopeKey, StoreError> {
    let (domain_id, tenant_id) = owner;
    let mut key = ScopeKey::system(schema.layer());
    for (field, value) in [(DOMAIN_ID, domain_id), (TENANT_ID, tenant_id)] {
        if !value.is_empty() {
            key = key.with(field, value.as_str()).map_err(|e| StoreError::Decode {
                key: format!("{}/{}", domain_id, tenant_id),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(key)
}

fn encode(quota: &Quota) -> Value {
    let mut blob = quota.to_json(Some(QUOTA_PREFIX));
    blob.insert(VERSION_MEMBER.to_string(), Value::from(quota.version()));
    if let Some(updated_at) = quota.updated_at() {
        blob.insert(UPDATED_AT_MEMBER.to_string(), Value::from(updated_at.timestamp_millis()));
    }
    Value::Object(blob)
}

fn decode(schema: &Arc<QuotaSchema>, key: ScopeKey, blob: &Value) -> Result<Quota, StoreError> {
    let quota = schema.decode(key, blob, Some(QUOTA_PREFIX))?;
    let version = blob.get(VERSION_MEMBER).and_then(Value::as_u64).unwrap_or(0);
    let updated_at = blob
        .get(UPDATED_AT_MEMBER)
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis);
    Ok(quota.with_version(version, updated_at))
}

#[async_trait]
impl QuotaStore for MetadataStore {
    async fn get(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Option<Quota>, StoreError> {
        let owner = owner_of(key)?;
        let owners = self.owners.lock().unwrap();
        owners
            .get(&owner)
            .and_then(|blob| blob.get(schema.name()))
            .map(|member| decode(schema, key.clone(), member))
            .transpose()
    }

    async fn set(&self, quota: &Quota) -> Result<Quota, StoreError> {
        let owner = owner_of(quota.key())?;
        let mut owners = self.owners.lock().unwrap();
        let blob = owners.entry(owner).or_default();
        let current = blob
            .get(quota.kind())
            .map(|member| member.get(VERSION_MEMBER).and_then(Value::as_u64).unwrap_or(0));
        let stored = next_version(quota, current)?;
        blob.insert(quota.kind().to_string(), encode(&stored));
        Ok(stored)
    }

    async fn delete(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<bool, StoreError> {
        let owner = owner_of(key)?;
        let mut owners = self.owners.lock().unwrap();
        let Some(blob) = owners.get_mut(&owner) else {
            return Ok(false);
        };

        let existed = blob.remove(schema.name()).is_some();
        if blob.is_empty() {
            owners.remove(&owner);
        }
        Ok(existed)
    }

    async fn list(&self, schema: &Arc<QuotaSchema>) -> Result<Vec<Quota>, StoreError> {
        let owners = self.owners.lock().unwrap();
        let mut quotas = Vec::new();
        for (owner, blob) in owners.iter() {
            if let Some(member) = blob.get(schema.name()) {
                quotas.push(decode(schema, key_of(schema, owner)?, member)?);
            }
        }
        Ok(quotas)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        scope::{KeyLayer, REGION_ID},
        test_util::{compute_schema, d1_t1},
    };

    #[tokio::test]
    async fn blob_layout() {
        let store = MetadataStore::new();
        let mut quota = Quota::defaults(&compute_schema(), d1_t1());
        quota.set("cpu", 12).unwrap();
        store.set(&quota).await.unwrap();

        let blob = store.metadata("d1", "t1").unwrap();
        assert_eq!(blob["compute"]["quota.cpu"], json!(12));
        assert_eq!(blob["compute"]["meta.version"], json!(1));

        let listed = store.list(&compute_schema()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key(), &d1_t1());
        assert_eq!(listed[0].get("cpu"), Some(12));
    }

    #[tokio::test]
    async fn platform_keys_rejected() {
        let schema = QuotaSchema::new("region", KeyLayer::ProjectRegion, vec![]);
        let key = ScopeKey::system(KeyLayer::ProjectRegion).with(REGION_ID, "r1").unwrap();

        let err = MetadataStore::new().get(&schema, &key).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
    }
}
