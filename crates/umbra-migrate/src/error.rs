//! Error types for the migration domain.

use umbra_core::{MigrationPhase, Namespace};

/// The result type used throughout umbra-migrate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in migration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A phase transition was attempted that the lifecycle does not allow.
    #[error("invalid phase transition: {from} -> {to} ({reason})")]
    InvalidTransition {
        /// The current phase.
        from: MigrationPhase,
        /// The attempted target phase.
        to: MigrationPhase,
        /// Why the transition was rejected.
        reason: String,
    },

    /// No migration plan exists for the namespace.
    #[error("no migration plan for namespace: {namespace}")]
    PlanNotFound {
        /// The namespace that was looked up.
        namespace: Namespace,
    },

    /// A live plan already exists for the namespace.
    #[error("migration plan already exists for namespace: {namespace}")]
    PlanExists {
        /// The namespace with the existing plan.
        namespace: Namespace,
    },

    /// An optimistic save kept losing the version race.
    ///
    /// Raised only after one reload-and-retry; the caller should surface
    /// this loudly rather than loop.
    #[error("config store conflict for namespace {namespace}: {message}")]
    ConfigConflict {
        /// The namespace whose record was contended.
        namespace: Namespace,
        /// What was being saved.
        message: String,
    },

    /// The backfill has halted after repeated batch failures and needs an
    /// operator `resume`.
    #[error("backfill stalled for namespace {namespace} after {consecutive_failures} consecutive batch failures")]
    BackfillStalled {
        /// The stalled namespace.
        namespace: Namespace,
        /// How many batches failed in a row before halting.
        consecutive_failures: u32,
    },

    /// The shadow backend health probe failed.
    #[error("shadow probe failed for namespace {namespace}: {message}")]
    ProbeFailed {
        /// The namespace being probed.
        namespace: Namespace,
        /// What the probe observed.
        message: String,
    },

    /// No backend is registered under the referenced name.
    #[error("unknown backend reference: {reference}")]
    UnknownBackend {
        /// The unresolvable reference.
        reference: String,
    },

    /// An error from umbra-core.
    #[error("core error: {0}")]
    Core(#[from] umbra_core::Error),
}

impl Error {
    /// Creates an invalid-transition error.
    #[must_use]
    pub fn invalid_transition(
        from: MigrationPhase,
        to: MigrationPhase,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            from,
            to,
            reason: reason.into(),
        }
    }

    /// Creates a plan-not-found error.
    #[must_use]
    pub fn plan_not_found(namespace: &Namespace) -> Self {
        Self::PlanNotFound {
            namespace: namespace.clone(),
        }
    }

    /// Creates a config-conflict error.
    #[must_use]
    pub fn config_conflict(namespace: &Namespace, message: impl Into<String>) -> Self {
        Self::ConfigConflict {
            namespace: namespace.clone(),
            message: message.into(),
        }
    }

    /// Creates a probe-failed error.
    #[must_use]
    pub fn probe_failed(namespace: &Namespace, message: impl Into<String>) -> Self {
        Self::ProbeFailed {
            namespace: namespace.clone(),
            message: message.into(),
        }
    }
}
