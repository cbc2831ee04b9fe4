//! Ground truth and identity collaborators.
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, RwLock},
};

use allot_error::GenericError;
use async_trait::async_trait;

use crate::{
    quota::{Quota, QuotaSchema},
    scope::{Scope, ScopeKey},
};

/// Source of real resource usage.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Computes the current usage of `schema`'s kind within `key`.
    ///
    /// Usage of every scope covered by `key` counts towards it.
    async fn fetch_usage(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Quota, GenericError>;
}

struct UsageSample {
    kind: String,
    key: ScopeKey,
    values: BTreeMap<String, u64>,
}

/// Usage source backed by recorded samples.
///
/// Each sample is the usage of one kind at one key. Fetching sums every sample at or below the requested key. Samples
/// of a more specific layer are reduced to the requested layer first, so zone samples count towards their project.
#[derive(Default)]
pub struct StaticUsageSource {
    samples: RwLock<Vec<UsageSample>>,
}

impl StaticUsageSource {
    /// Creates an empty `StaticUsageSource`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records usage of `kind` at `key`, replacing any earlier sample for the same kind and key.
    pub fn record<I, S>(&self, kind: &str, key: ScopeKey, values: I)
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let sample = UsageSample {
            kind: kind.to_string(),
            key,
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };

        let mut samples = self.samples.write().unwrap();
        samples.retain(|s| s.kind != sample.kind || s.key != sample.key);
        samples.push(sample);
    }

    /// Removes every sample.
    pub fn clear(&self) {
        self.samples.write().unwrap().clear();
    }
}

#[async_trait]
impl UsageSource for StaticUsageSource {
    async fn fetch_usage(&self, schema: &Arc<QuotaSchema>, key: &ScopeKey) -> Result<Quota, GenericError> {
        let samples = self.samples.read().unwrap();
        let mut usage = Quota::zero(schema, key.clone());

        for sample in samples.iter().filter(|s| s.kind == schema.name()) {
            let Ok(reduced) = sample.key.reduce_to(key.layer()) else {
                continue;
            };
            if !reduced.is_within(key) {
                continue;
            }

            for (field, value) in &sample.values {
                if let Some(current) = usage.get(field) {
                    usage.set(field, current.saturating_add(*value))?;
                }
            }
        }

        Ok(usage)
    }
}

/// Knows which domains and projects exist.
#[async_trait]
pub trait ScopeDirectory: Send + Sync {
    /// Returns `true` if the owner of `key` exists.
    async fn exists(&self, key: &ScopeKey) -> Result<bool, GenericError>;

    /// Returns, for each key, whether its owner exists.
    ///
    /// The default implementation calls [`exists`][Self::exists] once per key.
    async fn known_owners(&self, keys: &[ScopeKey]) -> Result<Vec<bool>, GenericError> {
        let mut known = Vec::with_capacity(keys.len());
        for key in keys {
            known.push(self.exists(key).await?);
        }
        Ok(known)
    }
}

/// Directory that knows every owner.
#[derive(Clone, Copy, Default)]
pub struct OpenDirectory;

#[async_trait]
impl ScopeDirectory for OpenDirectory {
    async fn exists(&self, _key: &ScopeKey) -> Result<bool, GenericError> {
        Ok(true)
    }
}

/// Directory over a fixed set of domains and projects.
#[derive(Default)]
pub struct StaticDirectory {
    domains: RwLock<HashSet<String>>,
    projects: RwLock<HashSet<(String, String)>>,
}

impl StaticDirectory {
    /// Creates an empty `StaticDirectory`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a domain.
    pub fn add_domain(&self, domain_id: impl Into<String>) {
        self.domains.write().unwrap().insert(domain_id.into());
    }

    /// Adds a project, and its domain.
    pub fn add_project(&self, domain_id: impl Into<String>, tenant_id: impl Into<String>) {
        let domain_id = domain_id.into();
        self.add_domain(domain_id.clone());
        self.projects.write().unwrap().insert((domain_id, tenant_id.into()));
    }

    /// Removes a project.
    pub fn remove_project(&self, domain_id: &str, tenant_id: &str) {
        self.projects
            .write()
            .unwrap()
            .remove(&(domain_id.to_string(), tenant_id.to_string()));
    }
}

#[async_trait]
impl ScopeDirectory for StaticDirectory {
    async fn exists(&self, key: &ScopeKey) -> Result<bool, GenericError> {
        let domain_id = key.domain_id().unwrap_or_default();
        let tenant_id = key.tenant_id().unwrap_or_default();

        Ok(match key.scope() {
            Scope::System => true,
            Scope::Domain => self.domains.read().unwrap().contains(domain_id),
            Scope::Project => self
                .projects
                .read()
                .unwrap()
                .contains(&(domain_id.to_string(), tenant_id.to_string())),
            Scope::None => false,
        })
    }
}
