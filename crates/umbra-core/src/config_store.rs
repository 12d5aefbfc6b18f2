//! Durable storage for migration plans and backfill cursors.
//!
//! Every write goes through optimistic concurrency: the caller presents the
//! version it loaded, and the store applies the write only if that is still
//! the current version. A lost race is a normal [`SaveResult::Conflict`]
//! outcome, not an error; callers reload and retry once, then fail loudly.
//!
//! Plans and cursors are separate records with independent version
//! counters, so the backfill engine's frequent cursor saves never contend
//! with operator commands on the plan.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::plan::{BackfillCursor, MigrationPlan};

/// Result of an optimistic-concurrency save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveResult {
    /// The write was applied; the record now has this version.
    Saved {
        /// The version assigned by the store.
        version: u64,
    },
    /// The stored version did not match the caller's expectation.
    Conflict {
        /// The version actually stored (0 if the record does not exist).
        current_version: u64,
    },
}

impl SaveResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Durable store for migration control records.
///
/// Implementations must provide read-your-writes consistency per record and
/// atomic versioned saves. The version counter starts at 0 for an absent
/// record: passing `expected_version = 0` means "create, fail if present".
/// On success the store assigns `expected_version + 1` and overwrites the
/// record's own `version` field with it.
///
/// An implementation that cannot reach its backing store at all returns
/// [`Error::Unavailable`]; at orchestrator startup that is fatal, because
/// the system must never run with an assumed migration phase.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Loads the plan for a namespace, or `None` if no plan exists.
    async fn load_plan(&self, namespace: &Namespace) -> Result<Option<MigrationPlan>>;

    /// Saves a plan if the stored version still matches `expected_version`.
    async fn save_plan(&self, plan: &MigrationPlan, expected_version: u64) -> Result<SaveResult>;

    /// Loads the backfill cursor for a namespace, or `None` if no cursor
    /// exists.
    async fn load_cursor(&self, namespace: &Namespace) -> Result<Option<BackfillCursor>>;

    /// Saves a cursor if the stored version still matches
    /// `expected_version`.
    async fn save_cursor(
        &self,
        cursor: &BackfillCursor,
        expected_version: u64,
    ) -> Result<SaveResult>;
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("config store lock poisoned")
}

/// In-memory config store for testing.
///
/// Thread-safe via `RwLock`; versions behave exactly like the production
/// contract so concurrency tests are meaningful.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    plans: RwLock<HashMap<Namespace, MigrationPlan>>,
    cursors: RwLock<HashMap<Namespace, BackfillCursor>>,
}

impl MemoryConfigStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_plan(&self, namespace: &Namespace) -> Result<Option<MigrationPlan>> {
        let plans = self.plans.read().map_err(poison_err)?;
        Ok(plans.get(namespace).cloned())
    }

    async fn save_plan(&self, plan: &MigrationPlan, expected_version: u64) -> Result<SaveResult> {
        let mut plans = self.plans.write().map_err(poison_err)?;
        let current_version = plans.get(&plan.namespace).map_or(0, |p| p.version);
        if current_version != expected_version {
            return Ok(SaveResult::Conflict { current_version });
        }

        let mut stored = plan.clone();
        stored.version = expected_version + 1;
        plans.insert(plan.namespace.clone(), stored);
        Ok(SaveResult::Saved {
            version: expected_version + 1,
        })
    }

    async fn load_cursor(&self, namespace: &Namespace) -> Result<Option<BackfillCursor>> {
        let cursors = self.cursors.read().map_err(poison_err)?;
        Ok(cursors.get(namespace).cloned())
    }

    async fn save_cursor(
        &self,
        cursor: &BackfillCursor,
        expected_version: u64,
    ) -> Result<SaveResult> {
        let mut cursors = self.cursors.write().map_err(poison_err)?;
        let current_version = cursors.get(&cursor.namespace).map_or(0, |c| c.version);
        if current_version != expected_version {
            return Ok(SaveResult::Conflict { current_version });
        }

        let mut stored = cursor.clone();
        stored.version = expected_version + 1;
        cursors.insert(cursor.namespace.clone(), stored);
        Ok(SaveResult::Saved {
            version: expected_version + 1,
        })
    }
}
