//! Quota configuration.
use std::{collections::HashSet, sync::Arc, time::Duration};

use allot_config::GenericConfiguration;
use allot_error::{generic_error, GenericError};
use serde::Deserialize;

use crate::{
    quota::{QuotaField, QuotaSchema},
    reconcile::ReconcilerConfig,
    scope::KeyLayer,
};

const fn default_true() -> bool {
    true
}

const fn default_lock_timeout_ms() -> u64 {
    5000
}

/// A quota kind as declared in configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct QuotaKindConfiguration {
    /// Kind name.
    pub name: String,

    /// Key layer of the kind's rows.
    pub layer: KeyLayer,

    /// Fields with their system defaults.
    pub fields: Vec<QuotaField>,
}

/// Quota subsystem configuration, read from the `quota` section.
///
/// ```yaml
/// quota:
///   enforce: true
///   auto_provision: true
///   lock_timeout_ms: 5000
///   reconcile:
///     queue_capacity: 1024
///     queue_full_policy: block
///     sweep_interval_secs: 300
///     max_passes: 3
///     pending_ttl_secs: 3600
///   kinds:
///     - name: compute
///       layer: project
///       fields:
///         - { name: cpu, default: 64 }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct QuotaConfiguration {
    /// Whether exceeded limits deny admission.
    #[serde(default = "default_true")]
    pub enforce: bool,

    /// Whether missing rows are created from defaults on first access.
    #[serde(default = "default_true")]
    pub auto_provision: bool,

    /// Milliseconds to wait for a scope lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Usage reconciler settings.
    #[serde(default)]
    pub reconcile: ReconcilerConfig,

    /// Declared quota kinds.
    #[serde(default)]
    pub kinds: Vec<QuotaKindConfiguration>,
}

impl Default for QuotaConfiguration {
    fn default() -> Self {
        Self {
            enforce: true,
            auto_provision: true,
            lock_timeout_ms: default_lock_timeout_ms(),
            reconcile: ReconcilerConfig::default(),
            kinds: Vec::new(),
        }
    }
}

impl QuotaConfiguration {
    /// Reads the `quota` section of `config`, falling back to defaults when it is absent.
    ///
    /// # Errors
    ///
    /// If the section cannot be deserialized, or declares invalid kinds, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let quota_config: Option<Self> = config.try_get_typed("quota")?;
        let quota_config = quota_config.unwrap_or_default();
        quota_config.validate()?;
        Ok(quota_config)
    }

    fn validate(&self) -> Result<(), GenericError> {
        if self.reconcile.queue_capacity == 0 {
            return Err(generic_error!("quota.reconcile.queue_capacity must be greater than zero."));
        }
        if self.reconcile.max_passes == 0 {
            return Err(generic_error!("quota.reconcile.max_passes must be greater than zero."));
        }

        let mut names = HashSet::new();
        for kind in &self.kinds {
            if kind.name.is_empty() {
                return Err(generic_error!("Quota kind names must not be empty."));
            }
            if !names.insert(kind.name.as_str()) {
                return Err(generic_error!("Quota kind '{}' is declared more than once.", kind.name));
            }
            if kind.fields.is_empty() {
                return Err(generic_error!("Quota kind '{}' declares no fields.", kind.name));
            }

            let mut fields = HashSet::new();
            for field in &kind.fields {
                if !fields.insert(field.name.as_str()) {
                    return Err(generic_error!(
                        "Quota kind '{}' declares field '{}' more than once.",
                        kind.name,
                        field.name
                    ));
                }
            }
        }

        Ok(())
    }

    /// Returns how long to wait for a scope lock.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Builds a schema for every declared kind.
    pub fn schemas(&self) -> Vec<Arc<QuotaSchema>> {
        self.kinds
            .iter()
            .map(|kind| QuotaSchema::new(kind.name.clone(), kind.layer, kind.fields.clone()))
            .collect()
    }

    /// Returns the names of every declared kind.
    pub fn kind_names(&self) -> Vec<&str> {
        self.kinds.iter().map(|kind| kind.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use allot_config::ConfigurationLoader;

    use super::*;
    use crate::reconcile::QueueFullPolicy;

    fn load(yaml: &str) -> Result<QuotaConfiguration, GenericError> {
        let config = ConfigurationLoader::default().from_yaml_str(yaml).unwrap().into_generic();
        QuotaConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults_without_section() {
        let config = load("log_level: info").unwrap();
        assert!(config.enforce);
        assert!(config.auto_provision);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconcile.queue_capacity, 1024);
        assert_eq!(config.reconcile.queue_full_policy, QueueFullPolicy::Block);
        assert_eq!(config.reconcile.sweep_interval_secs, 300);
        assert_eq!(config.reconcile.max_passes, 3);
        assert!(config.kinds.is_empty());
    }

    #[test]
    fn kinds_become_schemas() {
        let config = load(
            r#"
quota:
  enforce: false
  lock_timeout_ms: 250
  reconcile:
    queue_full_policy: skip
    pending_ttl_secs: 600
  kinds:
    - name: compute
      layer: project
      fields:
        - { name: cpu, default: 64 }
        - { name: memory }
    - name: region
      layer: project_region
      fields:
        - { name: eip, default: 5 }
"#,
        )
        .unwrap();

        assert!(!config.enforce);
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.reconcile.queue_full_policy, QueueFullPolicy::Skip);
        assert_eq!(config.reconcile.pending_ttl_secs, 600);
        assert_eq!(config.kind_names(), vec!["compute", "region"]);

        let schemas = config.schemas();
        assert_eq!(schemas[0].layer(), KeyLayer::Project);
        assert_eq!(schemas[0].fields()[0], QuotaField::new("cpu", 64));
        assert_eq!(schemas[0].fields()[1].default, 0);
        assert_eq!(schemas[1].layer(), KeyLayer::ProjectRegion);
    }

    #[test]
    fn invalid_kinds_rejected() {
        let duplicate = r#"
quota:
  kinds:
    - { name: compute, layer: project, fields: [{ name: cpu }] }
    - { name: compute, layer: project, fields: [{ name: cpu }] }
"#;
        assert!(load(duplicate).is_err());

        let no_fields = "quota:\n  kinds:\n    - { name: compute, layer: project, fields: [] }";
        assert!(load(no_fields).is_err());

        let bad_layer = "quota:\n  kinds:\n    - { name: compute, layer: galaxy, fields: [{ name: cpu }] }";
        assert!(load(bad_layer).is_err());

        assert!(load("quota:\n  reconcile:\n    max_passes: 0").is_err());
    }
}
