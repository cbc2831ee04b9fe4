//! Request-scoped reservation tracking.
use tracing::{debug, warn};

use crate::{
    error::{CancelError, CancelFailure},
    quota::Quota,
    registry::QuotaRegistry,
};

/// Reservations made while handling one request or workflow.
///
/// Created at request entry and threaded through the call chain by `&mut`. Once real usage has absorbed the
/// reservations, [`clear`][Self::clear] it. If the request fails, [`cancel_all`][Self::cancel_all] releases every
/// reservation made so far.
///
/// Dropping a non-empty accumulator logs a warning. Its reservations stay in the pending store until the
/// reconciler's sweep expires rows left unchanged for `quota.reconcile.pending_ttl_secs`.
#[derive(Default)]
pub struct PendingUsages {
    entries: Vec<Quota>,
}

impl PendingUsages {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records reservations.
    pub fn save<I>(&mut self, quotas: I)
    where
        I: IntoIterator<Item = Quota>,
    {
        self.entries.extend(quotas);
    }

    /// Forgets every reservation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over the reservations in the order they were made.
    pub fn iter(&self) -> impl Iterator<Item = &Quota> {
        self.entries.iter()
    }

    /// Number of reservations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no reservations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancels every reservation through the manager of its kind.
    ///
    /// Every entry is attempted, in order. Entries that were cancelled are removed, so afterwards the accumulator
    /// holds exactly the entries that failed.
    ///
    /// # Errors
    ///
    /// If any cancellation failed, an error listing every failure is returned.
    pub async fn cancel_all(&mut self, registry: &QuotaRegistry, actor: &str) -> Result<(), CancelError> {
        let entries = std::mem::take(&mut self.entries);
        let mut failures = Vec::new();

        for entry in entries {
            let result = match registry.dispatch(&entry) {
                Ok(manager) => manager
                    .cancel_pending_usage(actor, None, &entry, false)
                    .await
                    .map_err(CancelFailure::Quota),
                Err(e) => Err(CancelFailure::Registry(e)),
            };

            if let Err(e) = result {
                warn!(kind = entry.kind(), scope = %entry.key(), actor, error = %e, "Failed to cancel pending usage.");
                failures.push((entry.key().clone(), e));
                self.entries.push(entry);
            }
        }

        if failures.is_empty() {
            debug!(actor, "Cancelled all pending usage.");
            Ok(())
        } else {
            Err(CancelError { failures })
        }
    }
}

impl Drop for PendingUsages {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            let scopes = self
                .entries
                .iter()
                .map(|q| format!("{}/{}", q.kind(), q.key()))
                .collect::<Vec<_>>()
                .join(", ");
            warn!(
                count = self.entries.len(),
                scopes = %scopes,
                "Dropped pending usage that was neither cleared nor cancelled."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RegistryError,
        manager::QuotaManager,
        quota::{QuotaField, QuotaSchema},
        scope::{KeyLayer, ScopeKey},
        test_util::{compute_schema, cpu, d1_t1},
    };

    #[tokio::test]
    async fn cancel_all_keeps_only_failures() {
        let compute = QuotaManager::builder(compute_schema()).build();
        let registry = QuotaRegistry::builder().register(compute.clone()).build(["compute"]).unwrap();
        let other = ScopeKey::project("d1", "t2");

        let mut pending = PendingUsages::new();
        compute.reserve("alice", &mut pending, &cpu(d1_t1(), 2)).await.unwrap();
        pending.save([Quota::zero(
            &QuotaSchema::new("storage", KeyLayer::Project, vec![QuotaField::new("disk", 1)]),
            d1_t1(),
        )]);
        compute.reserve("alice", &mut pending, &cpu(other.clone(), 3)).await.unwrap();
        assert_eq!(pending.len(), 3);

        let err = pending.cancel_all(&registry, "alice").await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(matches!(err.failures[0].1, CancelFailure::Registry(RegistryError::Unregistered { .. })));

        // Entries on both sides of the failure were cancelled.
        assert!(compute.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
        assert!(compute.get_pending_usage(&other).await.unwrap().is_empty());

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.iter().next().unwrap().kind(), "storage");
        pending.clear();
    }

    #[tokio::test]
    async fn cancel_all_empties_on_success() {
        let compute = QuotaManager::builder(compute_schema()).build();
        let registry = QuotaRegistry::builder().register(compute.clone()).build(["compute"]).unwrap();

        let mut pending = PendingUsages::new();
        compute.reserve("alice", &mut pending, &cpu(d1_t1(), 4)).await.unwrap();
        compute.reserve("alice", &mut pending, &cpu(d1_t1(), 1)).await.unwrap();
        assert_eq!(compute.get_pending_usage(&d1_t1()).await.unwrap().get("cpu"), Some(5));

        pending.cancel_all(&registry, "alice").await.unwrap();
        assert!(pending.is_empty());
        assert!(compute.get_pending_usage(&d1_t1()).await.unwrap().is_empty());
    }
}
