//! Resumable copy of existing data from primary to shadow.
//!
//! The engine scans the primary in key order one batch at a time, writes
//! each batch into the shadow (plain puts, safe to repeat), then persists
//! the scan position. A crash or stop loses at most one batch of progress,
//! and re-copying that batch converges to the same shadow state.
//!
//! The cursor is the engine's only durable state and carries the `plan_id`
//! of the pass that produced it, so a cursor left behind by a rolled-back
//! migration never counts as progress for a new one. Copy throughput is
//! capped by a token-bucket limiter sized so one full batch can always be
//! drawn at once.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, info, warn};

use umbra_core::{
    BackfillCursor, ConfigStore, KeyValueBackend, MigrationPhase, MigrationPlan, Namespace,
    SaveResult,
};

use crate::config::BackfillConfig;
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::registry::BackendRegistry;

type ThroughputLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Pause between batch retries after a failure.
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// How a backfill run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The primary was drained; the cursor is marked completed.
    Completed,
    /// A stop flag, pause, or phase change ended the run at a batch
    /// boundary. Progress up to the last saved batch is kept.
    Stopped,
    /// Too many consecutive batch failures; `backfill_stalled` is set on
    /// the plan and the engine will not run again until an operator
    /// resumes.
    Stalled,
}

enum BatchResult {
    /// Batch copied and the cursor moved forward.
    Advanced { copied: u64 },
    /// The scan ran out of items; the cursor is now completed.
    Drained { copied: u64 },
}

/// Copies a namespace's existing data into the shadow backend.
pub struct BackfillEngine {
    store: Arc<dyn ConfigStore>,
    registry: Arc<BackendRegistry>,
    metrics: Arc<MigrationMetrics>,
    config: BackfillConfig,
    op_timeout: Duration,
    limiter: Option<ThroughputLimiter>,
}

impl std::fmt::Debug for BackfillEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackfillEngine")
            .field("config", &self.config)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl BackfillEngine {
    /// Creates an engine; limiter state carries across runs.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Arc<BackendRegistry>,
        metrics: Arc<MigrationMetrics>,
        config: BackfillConfig,
        op_timeout: Duration,
    ) -> Self {
        let limiter = NonZeroU32::new(config.max_items_per_sec).map(|rate| {
            let burst_raw = u32::try_from(config.batch_size.max(1)).unwrap_or(u32::MAX);
            let burst = NonZeroU32::new(burst_raw).unwrap_or(NonZeroU32::MIN);
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });
        Self {
            store,
            registry,
            metrics,
            config,
            op_timeout,
            limiter,
        }
    }

    /// Runs the backfill for one namespace until drained, stopped, or
    /// stalled.
    ///
    /// The stop flag, plan pauses, and phase changes are honored at batch
    /// boundaries only; a batch in flight always finishes and saves.
    ///
    /// # Errors
    ///
    /// Returns an error when the namespace has no plan, a backend
    /// reference does not resolve, or persisting the cursor fails twice
    /// in a row.
    pub async fn run(&self, namespace: &Namespace, stop: &AtomicBool) -> Result<BackfillOutcome> {
        let plan = self.load_plan(namespace).await?;
        if plan.phase != MigrationPhase::Backfilling {
            debug!(namespace = %namespace, phase = %plan.phase, "backfill asked outside BACKFILLING, ignoring");
            return Ok(BackfillOutcome::Stopped);
        }
        let primary = self.registry.resolve(&plan.primary)?;
        let shadow = self.registry.resolve(&plan.shadow)?;

        let mut cursor = match self.store.load_cursor(namespace).await? {
            Some(cursor) if cursor.plan_id == plan.plan_id => cursor,
            Some(stale) => {
                debug!(
                    namespace = %namespace,
                    stale_plan = %stale.plan_id,
                    plan = %plan.plan_id,
                    "discarding cursor from a previous migration pass"
                );
                let mut fresh = BackfillCursor::new(namespace.clone(), plan.plan_id, Utc::now());
                // Take over the stale record's version so the first save
                // replaces it instead of conflicting.
                fresh.version = stale.version;
                fresh
            }
            None => BackfillCursor::new(namespace.clone(), plan.plan_id, Utc::now()),
        };

        if cursor.completed {
            info!(
                namespace = %namespace,
                items_copied = cursor.items_copied,
                "backfill already completed"
            );
            return Ok(BackfillOutcome::Completed);
        }

        info!(
            namespace = %namespace,
            resumed = cursor.position.is_some(),
            items_copied = cursor.items_copied,
            "backfill starting"
        );

        let mut consecutive_failures = 0u32;
        loop {
            if stop.load(Ordering::Acquire) {
                info!(namespace = %namespace, items_copied = cursor.items_copied, "backfill stopped");
                return Ok(BackfillOutcome::Stopped);
            }

            let plan = self.load_plan(namespace).await?;
            if plan.paused || plan.phase != MigrationPhase::Backfilling || plan.plan_id != cursor.plan_id
            {
                info!(
                    namespace = %namespace,
                    phase = %plan.phase,
                    paused = plan.paused,
                    items_copied = cursor.items_copied,
                    "backfill stopped by plan state"
                );
                return Ok(BackfillOutcome::Stopped);
            }

            match self
                .copy_batch(namespace, primary.as_ref(), shadow.as_ref(), &mut cursor)
                .await
            {
                Ok(BatchResult::Advanced { copied }) => {
                    consecutive_failures = 0;
                    self.save_cursor(namespace, &mut cursor).await?;
                    self.metrics
                        .record_backfill_items(namespace, copied, Utc::now());
                    self.metrics.record_backfill_batch(namespace, "ok");
                }
                Ok(BatchResult::Drained { copied }) => {
                    self.save_cursor(namespace, &mut cursor).await?;
                    if copied > 0 {
                        self.metrics
                            .record_backfill_items(namespace, copied, Utc::now());
                    }
                    self.metrics.record_backfill_batch(namespace, "ok");
                    info!(
                        namespace = %namespace,
                        items_copied = cursor.items_copied,
                        "backfill completed"
                    );
                    return Ok(BackfillOutcome::Completed);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.metrics.record_backfill_batch(namespace, "error");
                    warn!(
                        namespace = %namespace,
                        consecutive_failures,
                        error = %err,
                        "backfill batch failed"
                    );
                    if consecutive_failures >= self.config.stall_after_failures.max(1) {
                        self.mark_stalled(namespace, consecutive_failures).await?;
                        return Ok(BackfillOutcome::Stalled);
                    }
                    tokio::time::sleep(BATCH_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn copy_batch(
        &self,
        namespace: &Namespace,
        primary: &dyn KeyValueBackend,
        shadow: &dyn KeyValueBackend,
        cursor: &mut BackfillCursor,
    ) -> Result<BatchResult> {
        let batch_size = self.config.batch_size.max(1);
        let page = primary
            .scan(namespace, cursor.position.as_ref(), batch_size, self.op_timeout)
            .await?;

        if page.items.is_empty() {
            cursor.mark_completed(Utc::now());
            return Ok(BatchResult::Drained { copied: 0 });
        }

        self.throttle(page.items.len()).await?;

        for item in &page.items {
            shadow
                .put(namespace, &item.key, item.value.clone(), self.op_timeout)
                .await?;
        }

        let copied = page.items.len() as u64;
        let now = Utc::now();
        match page.next {
            Some(next) => {
                cursor.advance(Some(next), copied, now);
                Ok(BatchResult::Advanced { copied })
            }
            None => {
                // Short page: the scan is done. Keep the old position;
                // completed makes it irrelevant.
                let position = cursor.position.clone();
                cursor.advance(position, copied, now);
                cursor.mark_completed(now);
                Ok(BatchResult::Drained { copied })
            }
        }
    }

    async fn throttle(&self, items: usize) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let Some(n) = u32::try_from(items).ok().and_then(NonZeroU32::new) else {
            return Ok(());
        };
        limiter
            .until_n_ready(n)
            .await
            .map_err(|err| umbra_core::Error::internal(format!("throttle burst too small: {err}")))?;
        Ok(())
    }

    async fn load_plan(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        self.store
            .load_plan(namespace)
            .await?
            .ok_or_else(|| Error::plan_not_found(namespace))
    }

    /// Persists the cursor, reloading and retrying once on a version
    /// conflict.
    async fn save_cursor(&self, namespace: &Namespace, cursor: &mut BackfillCursor) -> Result<()> {
        match self.store.save_cursor(cursor, cursor.version).await? {
            SaveResult::Saved { version } => {
                cursor.version = version;
                Ok(())
            }
            SaveResult::Conflict { current_version } => {
                debug!(
                    namespace = %namespace,
                    expected = cursor.version,
                    current = current_version,
                    "cursor save conflicted, reloading"
                );
                let reloaded_version = self
                    .store
                    .load_cursor(namespace)
                    .await?
                    .map_or(0, |c| c.version);
                match self.store.save_cursor(cursor, reloaded_version).await? {
                    SaveResult::Saved { version } => {
                        cursor.version = version;
                        Ok(())
                    }
                    SaveResult::Conflict { current_version } => Err(Error::config_conflict(
                        namespace,
                        format!("cursor save conflicted twice (version {current_version})"),
                    )),
                }
            }
        }
    }

    /// Sets `backfill_stalled` on the plan, reload-and-retry once.
    async fn mark_stalled(&self, namespace: &Namespace, failures: u32) -> Result<()> {
        warn!(
            namespace = %namespace,
            consecutive_failures = failures,
            "backfill stalled, operator resume required"
        );
        let mut plan = self.load_plan(namespace).await?;
        plan.backfill_stalled = true;
        plan.updated_at = Utc::now();
        match self.store.save_plan(&plan, plan.version).await? {
            SaveResult::Saved { .. } => Ok(()),
            SaveResult::Conflict { .. } => {
                let mut plan = self.load_plan(namespace).await?;
                plan.backfill_stalled = true;
                plan.updated_at = Utc::now();
                match self.store.save_plan(&plan, plan.version).await? {
                    SaveResult::Saved { .. } => Ok(()),
                    SaveResult::Conflict { .. } => Err(Error::config_conflict(
                        namespace,
                        "could not mark plan stalled",
                    )),
                }
            }
        }
    }
}
