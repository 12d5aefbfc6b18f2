//! Dual-write gate: the write path during migration.
//!
//! Every put and delete lands on the plan's primary backend synchronously;
//! the caller sees exactly the primary's result, nothing else. When the
//! plan's phase mirrors writes, a logically identical operation is handed
//! to the [`ShadowPool`] after the primary succeeds and applied to the
//! shadow backend asynchronously with bounded retries. Shadow failures are
//! counted and logged, never surfaced: a failed mirror is repaired later by
//! the backfill, and divergence shows up in the comparison metrics.
//!
//! There is no cross-key ordering. Two writes to the same key race
//! last-write-wins on the shadow side, which is the same contract the
//! backfill works under.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use umbra_core::{KeyValueBackend, Namespace};

use crate::config::ShadowWriteConfig;
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::plan_cache::PlanCache;
use crate::pool::{PoolJob, ShadowPool};
use crate::registry::BackendRegistry;

/// The mirrored operation a shadow job applies.
#[derive(Debug, Clone)]
enum ShadowOp {
    Put(Bytes),
    Delete,
}

impl ShadowOp {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Put(_) => "put",
            Self::Delete => "delete",
        }
    }
}

/// One asynchronous shadow write or delete.
///
/// The backend handle is resolved and pinned at submit time, so a plan
/// edit (rollback, promotion) between submit and execution cannot redirect
/// an already-queued job at a different store.
struct ShadowWriteJob {
    namespace: Namespace,
    key: String,
    op: ShadowOp,
    backend: Arc<dyn KeyValueBackend>,
    retry: ShadowWriteConfig,
    op_timeout: Duration,
    metrics: Arc<MigrationMetrics>,
}

#[async_trait]
impl PoolJob for ShadowWriteJob {
    async fn run(self: Box<Self>) {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let backoff = self.retry.backoff_for_attempt(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            let result = match &self.op {
                ShadowOp::Put(value) => {
                    self.backend
                        .put(&self.namespace, &self.key, value.clone(), self.op_timeout)
                        .await
                }
                ShadowOp::Delete => {
                    self.backend
                        .delete(&self.namespace, &self.key, self.op_timeout)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.metrics
                        .record_shadow_write_success(&self.namespace, Utc::now());
                    return;
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    debug!(
                        namespace = %self.namespace,
                        key = %self.key,
                        op = self.op.kind(),
                        backend = self.backend.name(),
                        attempt,
                        error = %err,
                        "shadow write attempt failed, retrying"
                    );
                }
                Err(err) => {
                    warn!(
                        namespace = %self.namespace,
                        key = %self.key,
                        op = self.op.kind(),
                        backend = self.backend.name(),
                        attempts = attempt,
                        error = %err,
                        "shadow write failed"
                    );
                    self.metrics
                        .record_shadow_write_error(&self.namespace, Utc::now());
                    return;
                }
            }
        }
    }

    fn abandon(self: Box<Self>) {
        debug!(
            namespace = %self.namespace,
            key = %self.key,
            op = self.op.kind(),
            "shadow write dropped by pool backpressure"
        );
        self.metrics
            .record_shadow_write_dropped(&self.namespace, Utc::now());
    }
}

/// The write path: synchronous primary writes with asynchronous shadow
/// mirroring.
pub struct DualWriteGate {
    plans: Arc<PlanCache>,
    registry: Arc<BackendRegistry>,
    pool: Arc<ShadowPool>,
    metrics: Arc<MigrationMetrics>,
    retry: ShadowWriteConfig,
    op_timeout: Duration,
}

impl std::fmt::Debug for DualWriteGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualWriteGate")
            .field("retry", &self.retry)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl DualWriteGate {
    /// Creates a gate over the shared runtime pieces.
    #[must_use]
    pub fn new(
        plans: Arc<PlanCache>,
        registry: Arc<BackendRegistry>,
        pool: Arc<ShadowPool>,
        metrics: Arc<MigrationMetrics>,
        retry: ShadowWriteConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            plans,
            registry,
            pool,
            metrics,
            retry,
            op_timeout,
        }
    }

    /// Writes a value through the migration.
    ///
    /// The primary write is synchronous and its result is returned to the
    /// caller unchanged. If the current phase mirrors writes, an identical
    /// shadow write is queued after the primary succeeds.
    ///
    /// # Errors
    ///
    /// Returns the primary backend's error, or
    /// [`Error::PlanNotFound`] when the namespace has no plan.
    pub async fn put(&self, namespace: &Namespace, key: &str, value: Bytes) -> Result<()> {
        let plan = self
            .plans
            .current(namespace)
            .ok_or_else(|| Error::plan_not_found(namespace))?;
        let primary = self.registry.resolve(&plan.primary)?;

        primary
            .put(namespace, key, value.clone(), self.op_timeout)
            .await?;

        if plan.phase.mirrors_writes() {
            self.mirror(namespace, key, ShadowOp::Put(value), &plan.shadow);
        }
        Ok(())
    }

    /// Deletes a key through the migration.
    ///
    /// Same dual-path contract as [`put`](Self::put): primary synchronous,
    /// shadow delete mirrored best-effort.
    ///
    /// # Errors
    ///
    /// Returns the primary backend's error, or
    /// [`Error::PlanNotFound`] when the namespace has no plan.
    pub async fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        let plan = self
            .plans
            .current(namespace)
            .ok_or_else(|| Error::plan_not_found(namespace))?;
        let primary = self.registry.resolve(&plan.primary)?;

        primary.delete(namespace, key, self.op_timeout).await?;

        if plan.phase.mirrors_writes() {
            self.mirror(namespace, key, ShadowOp::Delete, &plan.shadow);
        }
        Ok(())
    }

    fn mirror(
        &self,
        namespace: &Namespace,
        key: &str,
        op: ShadowOp,
        shadow_ref: &umbra_core::BackendRef,
    ) {
        let backend = match self.registry.resolve(shadow_ref) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(
                    namespace = %namespace,
                    key = %key,
                    shadow = %shadow_ref,
                    error = %err,
                    "shadow backend unresolvable, counting write as failed"
                );
                self.metrics
                    .record_shadow_write_error(namespace, Utc::now());
                return;
            }
        };

        self.pool.submit(Box::new(ShadowWriteJob {
            namespace: namespace.clone(),
            key: key.to_string(),
            op,
            backend,
            retry: self.retry.clone(),
            op_timeout: self.op_timeout,
            metrics: Arc::clone(&self.metrics),
        }));
    }
}
