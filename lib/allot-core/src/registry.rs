//! Quota kind registry.
use std::collections::{HashMap, HashSet};

use tracing::{error, warn};

use crate::{error::RegistryError, manager::QuotaManager, quota::Quota};

/// Builder for [`QuotaRegistry`].
#[derive(Default)]
pub struct QuotaRegistryBuilder {
    managers: Vec<QuotaManager>,
}

impl QuotaRegistryBuilder {
    /// Registers a manager under its kind.
    pub fn register(mut self, manager: QuotaManager) -> Self {
        self.managers.push(manager);
        self
    }

    /// Builds the registry, checking that every expected kind has exactly one manager.
    ///
    /// # Errors
    ///
    /// If a kind was registered twice, or an expected kind was never registered, an error is returned.
    pub fn build<I, S>(self, expected_kinds: I) -> Result<QuotaRegistry, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut managers = HashMap::with_capacity(self.managers.len());
        for manager in self.managers {
            let kind = manager.kind().to_string();
            if managers.contains_key(&kind) {
                return Err(RegistryError::Duplicate { kind });
            }
            managers.insert(kind, manager);
        }

        let mut missing = expected_kinds
            .into_iter()
            .map(|kind| kind.as_ref().to_string())
            .filter(|kind| !managers.contains_key(kind))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            missing.sort();
            return Err(RegistryError::Incomplete { missing });
        }

        Ok(QuotaRegistry { managers })
    }
}

/// Looks up the manager of a quota's kind.
///
/// Immutable once built.
pub struct QuotaRegistry {
    managers: HashMap<String, QuotaManager>,
}

impl QuotaRegistry {
    /// Creates a builder.
    pub fn builder() -> QuotaRegistryBuilder {
        QuotaRegistryBuilder::default()
    }

    /// Returns the manager of `kind`.
    pub fn get(&self, kind: &str) -> Option<&QuotaManager> {
        self.managers.get(kind)
    }

    /// Returns every registered kind, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds = self.managers.keys().map(String::as_str).collect::<Vec<_>>();
        kinds.sort_unstable();
        kinds
    }

    /// Iterates over every manager.
    pub fn managers(&self) -> impl Iterator<Item = &QuotaManager> {
        self.managers.values()
    }

    /// Returns the manager of `quota`'s kind.
    ///
    /// # Errors
    ///
    /// If the kind has no manager, an error is returned. This is a deployment bug and is logged as such.
    pub fn dispatch(&self, quota: &Quota) -> Result<&QuotaManager, RegistryError> {
        self.managers.get(quota.kind()).ok_or_else(|| {
            error!(kind = quota.kind(), "No quota manager registered for kind. Registration is incomplete.");
            RegistryError::Unregistered {
                kind: quota.kind().to_string(),
            }
        })
    }

    /// Cancels the pending usage of every quota, whatever its kind.
    ///
    /// Cancellation failures are logged and do not stop the batch.
    ///
    /// # Errors
    ///
    /// If a quota's kind has no manager, the rest of the batch is still processed and the first unregistered kind is
    /// returned.
    pub async fn cancel_usages(&self, actor: &str, quotas: &[Quota]) -> Result<(), RegistryError> {
        let mut unregistered = None;

        for quota in quotas {
            match self.dispatch(quota) {
                Ok(manager) => {
                    if let Err(e) = manager.cancel_pending_usage(actor, None, quota, false).await {
                        warn!(
                            kind = quota.kind(),
                            scope = %quota.key(),
                            actor,
                            error = %e,
                            "Failed to cancel pending usage."
                        );
                    }
                }
                Err(e) => {
                    unregistered.get_or_insert(e);
                }
            }
        }

        match unregistered {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quota::{QuotaField, QuotaSchema},
        scope::KeyLayer,
        test_util::{compute_schema, cpu, d1_t1},
    };

    fn storage_schema() -> std::sync::Arc<QuotaSchema> {
        QuotaSchema::new("storage", KeyLayer::Project, vec![QuotaField::new("disk", 100)])
    }

    #[tokio::test]
    async fn build_checks_completeness() {
        let compute = QuotaManager::builder(compute_schema()).build();

        let err = QuotaRegistry::builder()
            .register(compute.clone())
            .build(["compute", "storage", "storage"])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Incomplete { ref missing } if missing == &["storage".to_string()]));

        let err = QuotaRegistry::builder()
            .register(compute.clone())
            .register(compute.clone())
            .build(["compute"])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Duplicate { .. }));

        let registry = QuotaRegistry::builder().register(compute).build(["compute"]).unwrap();
        assert_eq!(registry.kinds(), vec!["compute"]);
        assert!(registry.get("compute").is_some());
    }

    #[tokio::test]
    async fn dispatch_by_kind() {
        let registry = QuotaRegistry::builder()
            .register(QuotaManager::builder(compute_schema()).build())
            .build(["compute"])
            .unwrap();

        assert_eq!(registry.dispatch(&cpu(d1_t1(), 1)).unwrap().kind(), "compute");

        let err = registry.dispatch(&Quota::zero(&storage_schema(), d1_t1())).err().unwrap();
        assert!(matches!(err, RegistryError::Unregistered { ref kind } if kind == "storage"));
    }

    #[tokio::test]
    async fn cancel_usages_finishes_batch() {
        let compute = QuotaManager::builder(compute_schema()).build();
        compute.check_set_pending_quota("alice", &cpu(d1_t1(), 2)).await.unwrap();
        let registry = QuotaRegistry::builder().register(compute.clone()).build(["compute"]).unwrap();

        let batch = vec![Quota::zero(&storage_schema(), d1_t1()), cpu(d1_t1(), 2)];
        let err = registry.cancel_usages("alice", &batch).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unregistered { .. }));

        // The compute reservation after the unregistered entry was still cancelled.
        assert!(compute.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
    }
}
