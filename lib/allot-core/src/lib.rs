//! Hierarchical quota accounting and admission control.
//!
//! Quota kinds are data: a [`QuotaSchema`] names a kind, the [`KeyLayer`] its rows are scoped by, and its numeric
//! fields. Each kind is served by a [`QuotaManager`], which checks request deltas against the limits of a scope and
//! of every stored ancestor scope, records reservations, and keeps persisted usage in line with ground truth through
//! a background [`UsageReconciler`]. A [`QuotaRegistry`] maps kinds to managers so that reservations of mixed kinds
//! can be rolled back together through [`PendingUsages`].
#![deny(missing_docs)]

pub mod config;
pub use self::config::{QuotaConfiguration, QuotaKindConfiguration};

mod error;
pub use self::error::{CancelError, CancelFailure, ExceededField, QuotaError, RegistryError, StoreError};

pub mod lock;
pub use self::lock::{LocalLockCoordinator, LockCoordinator, LockGuard};

mod manager;
pub use self::manager::{sort_by_usage_rate, QuotaListFilter, QuotaManager, QuotaManagerBuilder, QuotaReport};

mod pending;
pub use self::pending::PendingUsages;

pub mod quota;
pub use self::quota::{Quota, QuotaAction, QuotaField, QuotaSchema, QuotaUpdate};

pub mod reconcile;
pub use self::reconcile::{QueueFullPolicy, ReconcilerConfig, ReconcilerStores, UsageReconciler};

mod registry;
pub use self::registry::{QuotaRegistry, QuotaRegistryBuilder};

pub mod scope;
pub use self::scope::{KeyLayer, Relation, Scope, ScopeKey};

pub mod store;
pub use self::store::QuotaStore;

pub mod usage;
pub use self::usage::{OpenDirectory, ScopeDirectory, StaticDirectory, StaticUsageSource, UsageSource};

#[cfg(test)]
mod test_util;
