//! Shared read view of current migration plans.
//!
//! The gate and comparator consult the plan on every request; hitting the
//! config store each time would put a remote read on the traffic path. The
//! cache holds the last known plan per namespace. The orchestrator pushes
//! every plan it saves through [`PlanCache::apply`] immediately, and the
//! supervisor refreshes from the store once per tick, so external plan
//! edits converge within one reconfiguration cycle.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use umbra_core::{ConfigStore, MigrationPlan, Namespace};

use crate::error::Result;

/// Cached plan lookups for the traffic path.
pub struct PlanCache {
    store: Arc<dyn ConfigStore>,
    plans: RwLock<HashMap<Namespace, Arc<MigrationPlan>>>,
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache").finish_non_exhaustive()
    }
}

impl PlanCache {
    /// Creates a cache backed by the given store. Starts empty; call
    /// [`refresh`](Self::refresh) to warm a namespace.
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached plan for a namespace without touching the store.
    ///
    /// `None` means no plan is known, in which case the namespace is not
    /// under migration and carries no backend bindings.
    #[must_use]
    pub fn current(&self, namespace: &Namespace) -> Option<Arc<MigrationPlan>> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        plans.get(namespace).cloned()
    }

    /// Reloads a namespace's plan from the store and updates the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read; the cache keeps its
    /// previous entry in that case.
    pub async fn refresh(&self, namespace: &Namespace) -> Result<Option<Arc<MigrationPlan>>> {
        let loaded = self.store.load_plan(namespace).await?;
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        match loaded {
            Some(plan) => {
                let plan = Arc::new(plan);
                plans.insert(namespace.clone(), Arc::clone(&plan));
                Ok(Some(plan))
            }
            None => {
                plans.remove(namespace);
                Ok(None)
            }
        }
    }

    /// Installs a plan the caller just saved, making it visible to the
    /// traffic path without waiting for the next refresh.
    pub fn apply(&self, plan: MigrationPlan) {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.insert(plan.namespace.clone(), Arc::new(plan));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use umbra_core::{BackendRef, MemoryConfigStore, PhaseThresholds};

    fn test_plan(ns: &str) -> MigrationPlan {
        MigrationPlan::new(
            Namespace::new(ns).unwrap(),
            BackendRef::new("old"),
            BackendRef::new("new"),
            0.0,
            PhaseThresholds::default(),
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_pulls_from_store() {
        let store = Arc::new(MemoryConfigStore::new());
        let plan = test_plan("orders");
        store.save_plan(&plan, 0).await.unwrap();

        let cache = PlanCache::new(store);
        let ns = plan.namespace.clone();

        assert!(cache.current(&ns).is_none());
        let refreshed = cache.refresh(&ns).await.unwrap().unwrap();
        assert_eq!(refreshed.plan_id, plan.plan_id);
        assert!(cache.current(&ns).is_some());
    }

    #[tokio::test]
    async fn apply_is_visible_without_refresh() {
        let store = Arc::new(MemoryConfigStore::new());
        let cache = PlanCache::new(store);
        let plan = test_plan("orders");
        let ns = plan.namespace.clone();

        cache.apply(plan.clone());
        let cached = cache.current(&ns).unwrap();
        assert_eq!(cached.plan_id, plan.plan_id);
    }

    #[tokio::test]
    async fn refresh_clears_deleted_plans() {
        let store = Arc::new(MemoryConfigStore::new());
        let cache = PlanCache::new(store);
        let plan = test_plan("orders");
        let ns = plan.namespace.clone();

        cache.apply(plan);
        assert!(cache.current(&ns).is_some());

        // Store never had the record, so a refresh drops the cache entry.
        let refreshed = cache.refresh(&ns).await.unwrap();
        assert!(refreshed.is_none());
        assert!(cache.current(&ns).is_none());
    }
}
