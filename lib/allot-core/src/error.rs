use std::fmt;

use allot_error::GenericError;
use snafu::Snafu;

use crate::scope::ScopeKey;

/// A single field that would exceed its limit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceededField {
    /// Scope whose limit would be exceeded.
    ///
    /// This is the checked scope itself or one of its stored ancestors.
    pub scope: ScopeKey,

    /// Name of the exceeded field.
    pub field: String,

    /// Configured limit for the field.
    pub limit: u64,

    /// What the field would be at if the request was admitted.
    pub used: u64,
}

impl fmt::Display for ExceededField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}: requested {} exceeds limit {}",
            self.field, self.scope, self.used, self.limit
        )
    }
}

fn render_exceeded(exceeded: &[ExceededField]) -> String {
    exceeded.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

/// Store error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum StoreError {
    /// The row was modified since it was read.
    #[snafu(display("version conflict on {}: expected {}, found {}", key, expected, actual))]
    VersionConflict {
        /// Key of the conflicting row.
        key: String,

        /// Version the writer based its change on.
        expected: u64,

        /// Version currently stored.
        actual: u64,
    },

    /// The backend failed.
    #[snafu(display("quota store backend failed: {}", source))]
    Backend {
        /// Underlying error.
        source: GenericError,
    },

    /// A stored blob could not be decoded.
    #[snafu(display("failed to decode stored quota for {}: {}", key, reason))]
    Decode {
        /// Key of the undecodable row.
        key: String,

        /// What went wrong.
        reason: String,
    },
}

/// Quota error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum QuotaError {
    /// The scope's owner does not exist.
    #[snafu(display("scope {} not found", key))]
    NotFound {
        /// Scope that was looked up.
        key: ScopeKey,
    },

    /// Admitting the request would exceed one or more limits.
    #[snafu(display("out of {} quota: {}", kind, render_exceeded(exceeded)))]
    OutOfQuota {
        /// Quota kind that was checked.
        kind: String,

        /// Every field that would be exceeded, across the checked scope and its ancestors.
        exceeded: Vec<ExceededField>,
    },

    /// A scope lock could not be acquired in time.
    #[snafu(display("timed out after {:?} waiting for lock '{}'", waited, name))]
    LockTimeout {
        /// Lock name.
        name: String,

        /// How long the caller waited.
        waited: std::time::Duration,
    },

    /// The backing store failed.
    #[snafu(display("quota store error: {}", source))]
    Store {
        /// Underlying error.
        source: StoreError,
    },

    /// A scope key could not be built or reduced.
    #[snafu(display("invalid scope key: {}", reason))]
    InvalidKey {
        /// What was wrong with the key.
        reason: String,
    },

    /// A field is not part of the quota kind.
    #[snafu(display("quota kind '{}' has no field '{}'", kind, field))]
    UnknownField {
        /// Quota kind.
        kind: String,

        /// The unknown field.
        field: String,
    },

    /// An administrative action name was not recognized.
    #[snafu(display("unknown quota action '{}'", action))]
    InvalidAction {
        /// The unrecognized action.
        action: String,
    },

    /// Two quotas of different kinds were combined.
    #[snafu(display("cannot combine '{}' quota with '{}' quota", expected, actual))]
    KindMismatch {
        /// Kind of the receiver.
        expected: String,

        /// Kind of the argument.
        actual: String,
    },

    /// The operation is not allowed on this scope.
    #[snafu(display("operation forbidden on {}: {}", key, reason))]
    Forbidden {
        /// Scope the operation targeted.
        key: ScopeKey,

        /// Why the operation was rejected.
        reason: String,
    },

    /// The usage reconciler is no longer running.
    #[snafu(display("usage reconciler for '{}' is not running", kind))]
    ReconcilerStopped {
        /// Quota kind served by the reconciler.
        kind: String,
    },
}

impl QuotaError {
    /// Returns `true` if retrying the same operation later may succeed.
    ///
    /// Lock timeouts, store failures and version conflicts are transient. Out-of-quota is recoverable by the caller
    /// asking for less, so it's also reported as retryable. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfQuota { .. } | Self::LockTimeout { .. } | Self::Store { .. } | Self::ReconcilerStopped { .. }
        )
    }

    /// Returns `true` if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the exceeded fields if this is an out-of-quota error.
    pub fn exceeded(&self) -> Option<&[ExceededField]> {
        match self {
            Self::OutOfQuota { exceeded, .. } => Some(exceeded),
            _ => None,
        }
    }
}

impl From<StoreError> for QuotaError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

/// Registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum RegistryError {
    /// No manager is registered for a quota kind.
    #[snafu(display("no quota manager registered for kind '{}'", kind))]
    Unregistered {
        /// The unknown kind.
        kind: String,
    },

    /// Expected kinds were never registered.
    #[snafu(display("quota managers missing for kinds: {}", missing.join(", ")))]
    Incomplete {
        /// Kinds without a manager.
        missing: Vec<String>,
    },

    /// Two managers were registered for the same kind.
    #[snafu(display("quota kind '{}' registered more than once", kind))]
    Duplicate {
        /// The duplicated kind.
        kind: String,
    },
}

/// One failed cancellation inside a batch.
#[derive(Debug)]
pub enum CancelFailure {
    /// The manager rejected the cancellation.
    Quota(QuotaError),

    /// The quota's kind has no manager.
    Registry(RegistryError),
}

impl fmt::Display for CancelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quota(e) => e.fmt(f),
            Self::Registry(e) => e.fmt(f),
        }
    }
}

/// Aggregate cancellation error.
///
/// Every reservation in a batch is attempted. This holds one entry per reservation that could not be cancelled, in
/// batch order.
#[derive(Debug)]
pub struct CancelError {
    /// Individual failures, each paired with the scope of the reservation.
    pub failures: Vec<(ScopeKey, CancelFailure)>,
}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to cancel {} pending reservation(s)", self.failures.len())?;
        for (i, (key, e)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, key, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for CancelError {}
