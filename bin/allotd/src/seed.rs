//! Seed data and the in-process quota environment built from it.

use std::{collections::BTreeMap, sync::Arc};

use allot_config::GenericConfiguration;
use allot_core::{
    KeyLayer, Quota, QuotaConfiguration, QuotaManager, QuotaRegistry, QuotaSchema, ScopeKey, StaticUsageSource,
};
use allot_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::{debug, info};

/// Actor recorded for every change made by the CLI.
pub const ACTOR: &str = "allotd";

/// One seeded row.
///
/// ```yaml
/// - kind: compute
///   scope: { domain_id: d1, tenant_id: t1 }
///   values: { cpu: 4 }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct SeedEntry {
    kind: String,

    #[serde(default)]
    scope: BTreeMap<String, String>,

    #[serde(default)]
    values: BTreeMap<String, u64>,
}

/// Rows loaded into the stores and the usage source at startup, read from the `seed` section.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SeedConfiguration {
    #[serde(default)]
    limits: Vec<SeedEntry>,

    #[serde(default)]
    usage: Vec<SeedEntry>,
}

impl SeedConfiguration {
    fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let seed: Option<Self> = config.try_get_typed("seed")?;
        Ok(seed.unwrap_or_default())
    }
}

/// Managers for every configured kind, sharing one usage source.
pub struct Environment {
    registry: QuotaRegistry,
    usage: Arc<StaticUsageSource>,
}

impl Environment {
    /// Builds managers for every configured kind and loads the seed data into them.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or a seed entry refers to an unknown kind, scope field or quota field, an
    /// error is returned.
    pub async fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let quota_config =
            QuotaConfiguration::from_configuration(config).error_context("Invalid quota configuration.")?;
        if quota_config.kinds.is_empty() {
            return Err(generic_error!("No quota kinds configured. Declare at least one under `quota.kinds`."));
        }
        let seed = SeedConfiguration::from_configuration(config).error_context("Invalid seed data.")?;

        let usage = Arc::new(StaticUsageSource::new());
        let mut builder = QuotaRegistry::builder();
        for schema in quota_config.schemas() {
            let manager = QuotaManager::builder(schema)
                .with_configuration(&quota_config)
                .usage_source(usage.clone())
                .build();
            builder = builder.register(manager);
        }
        let registry = builder.build(quota_config.kind_names())?;

        let env = Self { registry, usage };
        env.load_seed(&seed).await?;
        Ok(env)
    }

    async fn load_seed(&self, seed: &SeedConfiguration) -> Result<(), GenericError> {
        for entry in &seed.usage {
            let schema = self.schema(&entry.kind)?;
            let key = scope_key(schema.layer(), &entry.scope)?;
            Quota::from_pairs(schema, key.clone(), entry.values.iter().map(|(f, v)| (f, *v)))?;
            self.usage
                .record(&entry.kind, key, entry.values.iter().map(|(f, v)| (f.clone(), *v)));
        }

        for entry in &seed.limits {
            let manager = self.manager(&entry.kind)?;
            let key = scope_key(manager.schema().layer(), &entry.scope)?;
            let quota = Quota::from_pairs(manager.schema(), key, entry.values.iter().map(|(f, v)| (f, *v)))?;
            manager
                .set_quota(ACTOR, &quota)
                .await
                .with_error_context(|| format!("Failed to seed {} limits for {}.", entry.kind, quota.key()))?;
            debug!(kind = %entry.kind, scope = %quota.key(), "Seeded limits.");
        }

        info!(
            limits = seed.limits.len(),
            usage = seed.usage.len(),
            kinds = self.registry.kinds().len(),
            "Loaded seed data."
        );
        Ok(())
    }

    /// Returns the registry of every configured kind.
    pub fn registry(&self) -> &QuotaRegistry {
        &self.registry
    }

    /// Returns the manager of `kind`.
    pub fn manager(&self, kind: &str) -> Result<&QuotaManager, GenericError> {
        self.registry.get(kind).ok_or_else(|| {
            generic_error!(
                "Unknown quota kind '{}'. Configured kinds: {}.",
                kind,
                self.registry.kinds().join(", ")
            )
        })
    }

    fn schema(&self, kind: &str) -> Result<&Arc<QuotaSchema>, GenericError> {
        self.manager(kind).map(|manager| manager.schema())
    }
}

/// Builds a key of `layer` from `(field, value)` pairs.
pub fn scope_key(layer: KeyLayer, scope: &BTreeMap<String, String>) -> Result<ScopeKey, GenericError> {
    let key = ScopeKey::from_pairs(layer, scope.iter().map(|(field, value)| (field, value.clone())))?;
    Ok(key)
}

/// Parses `field=value` pairs separated by commas, such as `domain_id=d1,tenant_id=t1`.
///
/// An empty string yields no pairs.
pub fn parse_pairs(raw: &str) -> Result<BTreeMap<String, String>, GenericError> {
    let mut pairs = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (field, value) = pair
            .split_once('=')
            .ok_or_else(|| generic_error!("Expected `field=value`, got '{}'.", pair))?;
        if pairs.insert(field.trim().to_string(), value.trim().to_string()).is_some() {
            return Err(generic_error!("Field '{}' given more than once.", field.trim()));
        }
    }
    Ok(pairs)
}

/// Parses `field=amount` pairs separated by commas, such as `cpu=2,memory=512`.
pub fn parse_amounts(raw: &str) -> Result<BTreeMap<String, u64>, GenericError> {
    parse_pairs(raw)?
        .into_iter()
        .map(|(field, value)| {
            let amount = value
                .parse::<u64>()
                .with_error_context(|| format!("Invalid amount '{}' for field '{}'.", value, field))?;
            Ok((field, amount))
        })
        .collect()
}
