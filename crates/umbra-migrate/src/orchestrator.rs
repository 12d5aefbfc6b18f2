//! The migration control plane.
//!
//! One orchestrator supervises every namespace's [`MigrationPlan`]: it
//! applies operator commands, evaluates trip-wires and metric-gated
//! automatic advances on a periodic tick, and owns the lifecycle of
//! backfill tasks. It never touches a data backend itself: health checks
//! go through the [`ShadowProbe`] collaborator, decision inputs come from
//! the [`MetricsFeed`], and everything it decides is expressed as a
//! versioned plan save.
//!
//! Every phase change funnels through one optimistic-concurrency helper:
//! load the plan, re-validate the guard, save against the loaded version,
//! and on conflict reload and retry exactly once before failing loudly.
//! A transition that was not durably saved never counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use umbra_core::{
    BackendRef, ConfigStore, MigrationPhase, MigrationPlan, Namespace, PhaseThresholds,
    PhaseTransition, PlanId, SaveResult, TransitionTrigger,
};

use crate::backfill::BackfillEngine;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricsFeed, MigrationMetrics};
use crate::plan_cache::PlanCache;
use crate::probe::ShadowProbe;
use crate::registry::BackendRegistry;

/// Inputs for creating a new migration plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    /// The namespace to migrate.
    pub namespace: Namespace,
    /// Backend currently serving traffic.
    pub primary: BackendRef,
    /// Backend being migrated onto.
    pub shadow: BackendRef,
    /// Fraction of reads compared while sampling, `0.0..=1.0`.
    pub sample_rate: f64,
    /// Guard thresholds for automatic transitions and trip-wires.
    pub thresholds: PhaseThresholds,
    /// Estimated item count, used only for progress reporting.
    pub expected_items: Option<u64>,
}

/// What one supervisor tick decided for a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Plan is paused; trip-wires and automatic advances were skipped.
    Suspended,
    /// Guards were evaluated and nothing fired.
    Idle,
    /// A trip-wire forced a rollback.
    TrippedRollback {
        /// Which wire fired and the rate that breached it.
        reason: String,
    },
    /// A metric-gated automatic advance was applied.
    AutoAdvanced {
        /// The phase the plan moved to.
        to: MigrationPhase,
    },
}

/// Operator-facing snapshot of one namespace's migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// The namespace.
    pub namespace: Namespace,
    /// The migration pass this status describes.
    pub plan_id: PlanId,
    /// Last durably persisted phase.
    pub phase: MigrationPhase,
    /// Backend currently serving traffic.
    pub primary: BackendRef,
    /// Backend being migrated onto.
    pub shadow: BackendRef,
    /// Whether automation is suspended.
    pub paused: bool,
    /// Whether the backfill halted on repeated failures.
    pub backfill_stalled: bool,
    /// Items the backfill has durably copied.
    pub items_copied: u64,
    /// Operator-provided size estimate, if any.
    pub expected_items: Option<u64>,
    /// Copy progress as a percentage. `None` when there is no estimate
    /// and the backfill has not completed; `100` once completed.
    pub backfill_progress: Option<f64>,
    /// Shadow-write success fraction over the plan's write window.
    pub write_success_rate: Option<f64>,
    /// Comparison mismatch fraction over the plan's mismatch window.
    pub mismatch_rate: Option<f64>,
    /// Most recent transitions, newest last.
    pub recent_transitions: Vec<PhaseTransition>,
}

struct BackfillHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Drives migration plans through their lifecycle.
pub struct MigrationOrchestrator {
    store: Arc<dyn ConfigStore>,
    plans: Arc<PlanCache>,
    registry: Arc<BackendRegistry>,
    feed: Arc<dyn MetricsFeed>,
    metrics: Arc<MigrationMetrics>,
    probe: Arc<dyn ShadowProbe>,
    backfill: Arc<BackfillEngine>,
    config: OrchestratorConfig,
    backfills: Mutex<HashMap<Namespace, BackfillHandle>>,
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationOrchestrator {
    /// Wires up the orchestrator over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        plans: Arc<PlanCache>,
        registry: Arc<BackendRegistry>,
        feed: Arc<dyn MetricsFeed>,
        metrics: Arc<MigrationMetrics>,
        probe: Arc<dyn ShadowProbe>,
        backfill: Arc<BackfillEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            plans,
            registry,
            feed,
            metrics,
            probe,
            backfill,
            config,
            backfills: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------

    /// Creates and persists a plan for a namespace with no live migration.
    ///
    /// A decommissioned plan may be replaced; anything else is
    /// [`Error::PlanExists`].
    ///
    /// # Errors
    ///
    /// Fails when a backend reference is unknown, a live plan exists, the
    /// request is invalid, or the store save loses a creation race.
    pub async fn create_plan(&self, request: CreatePlan) -> Result<MigrationPlan> {
        for reference in [&request.primary, &request.shadow] {
            if !self.registry.contains(reference) {
                return Err(Error::UnknownBackend {
                    reference: reference.to_string(),
                });
            }
        }

        let namespace = request.namespace.clone();
        let expected = match self.store.load_plan(&namespace).await? {
            Some(existing) if !existing.phase.is_terminal() => {
                return Err(Error::PlanExists { namespace });
            }
            Some(finished) => finished.version,
            None => 0,
        };

        let mut plan = MigrationPlan::new(
            request.namespace,
            request.primary,
            request.shadow,
            request.sample_rate,
            request.thresholds,
            request.expected_items,
            Utc::now(),
        )?;

        match self.store.save_plan(&plan, expected).await? {
            SaveResult::Saved { version } => {
                plan.version = version;
                self.plans.apply(plan.clone());
                info!(
                    namespace = %namespace,
                    plan_id = %plan.plan_id,
                    primary = %plan.primary,
                    shadow = %plan.shadow,
                    "migration plan created"
                );
                Ok(plan)
            }
            SaveResult::Conflict { .. } => match self.store.load_plan(&namespace).await? {
                Some(existing) if !existing.phase.is_terminal() => {
                    Err(Error::PlanExists { namespace })
                }
                _ => Err(Error::config_conflict(&namespace, "plan creation raced")),
            },
        }
    }

    /// Starts mirroring writes: `Idle` (or `RolledBack`) to `ShadowWrite`.
    ///
    /// The shadow backend must pass the health probe first.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing, the probe fails, or the current
    /// phase does not allow starting.
    pub async fn start_migration(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        let plan = self.load_plan_required(namespace).await?;
        self.probe.check(namespace, &plan.shadow).await?;
        self.transition(
            namespace,
            MigrationPhase::ShadowWrite,
            TransitionTrigger::Operator,
            "start_migration",
        )
        .await
    }

    /// Starts the bulk copy: `ShadowWrite` to `Backfilling`.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the phase does not allow it.
    pub async fn begin_backfill(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        let plan = self
            .transition(
                namespace,
                MigrationPhase::Backfilling,
                TransitionTrigger::Operator,
                "begin_backfill",
            )
            .await?;
        self.ensure_backfill_armed(&plan).await?;
        Ok(plan)
    }

    /// Suspends automation: trip-wires and automatic advances stop firing
    /// and the backfill idles at its next batch boundary. Mirroring and
    /// sampling continue; operator commands stay available.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the save conflicts twice.
    pub async fn pause(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        let plan = self
            .mutate_plan(namespace, |plan| {
                plan.paused = true;
                plan.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        info!(namespace = %namespace, phase = %plan.phase, "migration paused");
        Ok(plan)
    }

    /// Lifts a pause and clears a backfill stall, re-arming the backfill
    /// if there is copying left to do.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the save conflicts twice.
    pub async fn resume(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        let plan = self
            .mutate_plan(namespace, |plan| {
                plan.paused = false;
                plan.backfill_stalled = false;
                plan.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        info!(namespace = %namespace, phase = %plan.phase, "migration resumed");
        if plan.phase == MigrationPhase::Backfilling {
            self.ensure_backfill_armed(&plan).await?;
        }
        Ok(plan)
    }

    /// Promotes the shadow: `ShadowRead` to `Promoted`, swapping the
    /// primary/shadow bindings in the same plan save. The former primary
    /// keeps mirroring as the new shadow.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the phase does not allow it.
    pub async fn promote(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        self.promote_with(namespace, TransitionTrigger::Operator, "promote")
            .await
    }

    /// Abandons the migration: any non-terminal phase to `RolledBack`.
    ///
    /// If the plan was promoted, the binding swap is reverted in the same
    /// save, so traffic returns to the original primary immediately.
    /// Mirroring and sampling stop; the backfill is told to stop at its
    /// next batch boundary.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or already decommissioned.
    pub async fn rollback(&self, namespace: &Namespace, reason: &str) -> Result<MigrationPlan> {
        self.rollback_with(namespace, TransitionTrigger::Operator, reason)
            .await
    }

    /// Retires the old backend: `Promoted` to `Decommissioned`.
    ///
    /// Requires the confidence period to have elapsed since promotion
    /// with zero shadow-write errors, zero comparison mismatches, and
    /// zero shadow-read errors inside it.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the confidence guard does not
    /// hold.
    pub async fn decommission(
        &self,
        namespace: &Namespace,
        now: DateTime<Utc>,
    ) -> Result<MigrationPlan> {
        let feed = Arc::clone(&self.feed);
        let ns = namespace.clone();
        let plan = self
            .mutate_plan(namespace, move |plan| {
                Self::validate_transition(plan, MigrationPhase::Decommissioned)?;
                let confidence = plan.thresholds.confidence_period();
                let elapsed = now
                    .signed_duration_since(plan.phase_entered_at())
                    .to_std()
                    .unwrap_or_default();
                if elapsed < confidence {
                    return Err(Error::invalid_transition(
                        plan.phase,
                        MigrationPhase::Decommissioned,
                        format!(
                            "confidence period not elapsed ({}s of {}s)",
                            elapsed.as_secs(),
                            confidence.as_secs()
                        ),
                    ));
                }
                let writes = feed.shadow_write_rates(&ns, confidence, now);
                let reads = feed.comparison_rates(&ns, confidence, now);
                if writes.error > 0 || reads.mismatched > 0 || reads.errors > 0 {
                    return Err(Error::invalid_transition(
                        plan.phase,
                        MigrationPhase::Decommissioned,
                        format!(
                            "confidence period not clean ({} write errors, {} mismatches, {} read errors)",
                            writes.error, reads.mismatched, reads.errors
                        ),
                    ));
                }
                plan.record_transition(
                    MigrationPhase::Decommissioned,
                    TransitionTrigger::Operator,
                    "decommission",
                    Utc::now(),
                );
                Ok(())
            })
            .await?;
        self.log_transition(namespace, &plan);
        Ok(plan)
    }

    /// Reports the migration state of a namespace.
    ///
    /// The phase, flags, and transition trail come from the store, never
    /// from the in-memory cache, so the answer always reflects what was
    /// durably persisted.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing or the store is unreachable.
    pub async fn status(
        &self,
        namespace: &Namespace,
        now: DateTime<Utc>,
    ) -> Result<MigrationStatus> {
        let plan = self.load_plan_required(namespace).await?;
        let cursor = self
            .store
            .load_cursor(namespace)
            .await?
            .filter(|c| c.plan_id == plan.plan_id);

        let items_copied = cursor.as_ref().map_or(0, |c| c.items_copied);
        let completed = cursor.as_ref().is_some_and(|c| c.completed);
        let backfill_progress = Self::progress(items_copied, plan.expected_items, completed);

        let writes = self
            .feed
            .shadow_write_rates(namespace, plan.thresholds.write_window(), now);
        let reads = self
            .feed
            .comparison_rates(namespace, plan.thresholds.mismatch_window(), now);

        let limit = self.config.status_transition_limit;
        Ok(MigrationStatus {
            namespace: namespace.clone(),
            plan_id: plan.plan_id,
            phase: plan.phase,
            primary: plan.primary.clone(),
            shadow: plan.shadow.clone(),
            paused: plan.paused,
            backfill_stalled: plan.backfill_stalled,
            items_copied,
            expected_items: plan.expected_items,
            backfill_progress,
            write_success_rate: writes.success_rate(),
            mismatch_rate: reads.mismatch_rate(),
            recent_transitions: plan.recent_transitions(limit).to_vec(),
        })
    }

    // ------------------------------------------------------------------
    // Periodic evaluation
    // ------------------------------------------------------------------

    /// Evaluates trip-wires, then automatic advances, for one namespace.
    ///
    /// Trip-wires win over advances. A paused plan suspends both. Every
    /// resulting transition goes through the same versioned save path as
    /// operator commands.
    ///
    /// # Errors
    ///
    /// Fails when the plan is missing, the store is unreachable, or a
    /// resulting save conflicts twice.
    pub async fn tick(&self, namespace: &Namespace, now: DateTime<Utc>) -> Result<TickOutcome> {
        let started = Instant::now();
        let outcome = self.evaluate_tick(namespace, now).await;
        self.metrics
            .observe_tick_duration(namespace, started.elapsed());
        outcome
    }

    async fn evaluate_tick(
        &self,
        namespace: &Namespace,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let plan = self.load_plan_required(namespace).await?;

        if plan.paused {
            return Ok(TickOutcome::Suspended);
        }
        if matches!(
            plan.phase,
            MigrationPhase::Idle | MigrationPhase::RolledBack | MigrationPhase::Decommissioned
        ) {
            return Ok(TickOutcome::Idle);
        }

        let writes = self
            .feed
            .shadow_write_rates(namespace, plan.thresholds.write_window(), now);
        let reads = self
            .feed
            .comparison_rates(namespace, plan.thresholds.mismatch_window(), now);

        if let Some(error_rate) = writes.error_rate() {
            if error_rate > plan.thresholds.tripwire_write_error_max {
                let reason = format!(
                    "shadow write error rate {error_rate:.4} breached trip-wire {:.4}",
                    plan.thresholds.tripwire_write_error_max
                );
                self.rollback_with(namespace, TransitionTrigger::TripWire, &reason)
                    .await?;
                return Ok(TickOutcome::TrippedRollback { reason });
            }
        }
        if let Some(mismatch_rate) = reads.mismatch_rate() {
            if mismatch_rate > plan.thresholds.tripwire_mismatch_max {
                let reason = format!(
                    "comparison mismatch rate {mismatch_rate:.4} breached trip-wire {:.4}",
                    plan.thresholds.tripwire_mismatch_max
                );
                self.rollback_with(namespace, TransitionTrigger::TripWire, &reason)
                    .await?;
                return Ok(TickOutcome::TrippedRollback { reason });
            }
        }

        match plan.phase {
            MigrationPhase::ShadowWrite => {
                if writes
                    .success_rate()
                    .is_some_and(|rate| rate >= plan.thresholds.write_success_min)
                {
                    let plan = self
                        .transition(
                            namespace,
                            MigrationPhase::Backfilling,
                            TransitionTrigger::Automatic,
                            "shadow write success rate reached threshold",
                        )
                        .await?;
                    self.ensure_backfill_armed(&plan).await?;
                    return Ok(TickOutcome::AutoAdvanced {
                        to: MigrationPhase::Backfilling,
                    });
                }
            }
            MigrationPhase::Backfilling => {
                let cursor = self.store.load_cursor(namespace).await?;
                let completed = cursor
                    .as_ref()
                    .is_some_and(|c| c.plan_id == plan.plan_id && c.completed);
                // No write traffic is not counter-evidence; only observed
                // failures hold the gate.
                let writes_healthy = writes
                    .success_rate()
                    .map_or(true, |rate| rate >= plan.thresholds.write_success_min);
                if completed && writes_healthy {
                    self.transition(
                        namespace,
                        MigrationPhase::ShadowRead,
                        TransitionTrigger::Automatic,
                        "backfill completed with healthy shadow writes",
                    )
                    .await?;
                    return Ok(TickOutcome::AutoAdvanced {
                        to: MigrationPhase::ShadowRead,
                    });
                }
                if !completed && !plan.backfill_stalled {
                    self.ensure_backfill_armed(&plan).await?;
                }
            }
            MigrationPhase::ShadowRead => {
                if reads
                    .mismatch_rate()
                    .is_some_and(|rate| rate <= plan.thresholds.mismatch_max)
                {
                    self.promote_with(
                        namespace,
                        TransitionTrigger::Automatic,
                        "mismatch rate below threshold",
                    )
                    .await?;
                    return Ok(TickOutcome::AutoAdvanced {
                        to: MigrationPhase::Promoted,
                    });
                }
            }
            _ => {}
        }

        Ok(TickOutcome::Idle)
    }

    /// Rebuilds runtime state for one namespace after a process restart.
    ///
    /// Loads the durable plan into the cache and re-arms the backfill only
    /// when the phase is `Backfilling` with copying still to do. Returns
    /// the reconciled phase, or `None` when the namespace has no plan.
    ///
    /// # Errors
    ///
    /// Propagates store errors; an unreachable store must abort startup
    /// rather than let traffic run under an assumed phase.
    pub async fn reconcile(&self, namespace: &Namespace) -> Result<Option<MigrationPhase>> {
        let Some(plan) = self.store.load_plan(namespace).await? else {
            debug!(namespace = %namespace, "no migration plan to reconcile");
            return Ok(None);
        };
        self.plans.apply(plan.clone());
        if plan.phase == MigrationPhase::Backfilling && !plan.paused && !plan.backfill_stalled {
            self.ensure_backfill_armed(&plan).await?;
        }
        info!(
            namespace = %namespace,
            plan_id = %plan.plan_id,
            phase = %plan.phase,
            paused = plan.paused,
            backfill_stalled = plan.backfill_stalled,
            "reconciled migration state"
        );
        Ok(Some(plan.phase))
    }

    /// Spawns the periodic supervisor loop for one namespace.
    ///
    /// Each cycle refreshes the plan cache (so the gate and comparator see
    /// plan edits) and runs one [`tick`](Self::tick).
    pub fn spawn_supervisor(self: &Arc<Self>, namespace: Namespace) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.config.tick_interval());
            // The first tick completes immediately to align the interval.
            interval.tick().await;
            info!(namespace = %namespace, "migration supervisor started");
            loop {
                interval.tick().await;
                match orchestrator.plans.refresh(&namespace).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(namespace = %namespace, "no plan yet, supervisor idling");
                        continue;
                    }
                    Err(err) => {
                        warn!(namespace = %namespace, error = %err, "plan refresh failed");
                        continue;
                    }
                }
                match orchestrator.tick(&namespace, Utc::now()).await {
                    Ok(TickOutcome::Idle | TickOutcome::Suspended) => {}
                    Ok(outcome) => {
                        info!(namespace = %namespace, ?outcome, "supervisor acted");
                    }
                    Err(err) => warn!(namespace = %namespace, error = %err, "tick failed"),
                }
            }
        })
    }

    /// Stops every running backfill and waits for the tasks to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<BackfillHandle> = {
            let mut backfills = self.lock_backfills();
            backfills.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.stop.store(true, Ordering::Release);
        }
        for handle in handles {
            if handle.task.await.is_err() {
                error!("backfill task panicked during shutdown");
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn promote_with(
        &self,
        namespace: &Namespace,
        trigger: TransitionTrigger,
        reason: &str,
    ) -> Result<MigrationPlan> {
        let reason = reason.to_string();
        let plan = self
            .mutate_plan(namespace, move |plan| {
                Self::validate_transition(plan, MigrationPhase::Promoted)?;
                plan.record_transition(
                    MigrationPhase::Promoted,
                    trigger,
                    reason.clone(),
                    Utc::now(),
                );
                plan.swap_bindings();
                Ok(())
            })
            .await?;
        self.log_transition(namespace, &plan);
        Ok(plan)
    }

    async fn rollback_with(
        &self,
        namespace: &Namespace,
        trigger: TransitionTrigger,
        reason: &str,
    ) -> Result<MigrationPlan> {
        let reason = reason.to_string();
        let plan = self
            .mutate_plan(namespace, move |plan| {
                Self::validate_transition(plan, MigrationPhase::RolledBack)?;
                let was_promoted = plan.phase == MigrationPhase::Promoted;
                plan.record_transition(
                    MigrationPhase::RolledBack,
                    trigger,
                    reason.clone(),
                    Utc::now(),
                );
                if was_promoted {
                    plan.swap_bindings();
                }
                Ok(())
            })
            .await?;
        self.signal_backfill_stop(namespace);
        self.log_transition(namespace, &plan);
        Ok(plan)
    }

    /// Applies a plain guard-checked transition through the CAS helper.
    async fn transition(
        &self,
        namespace: &Namespace,
        to: MigrationPhase,
        trigger: TransitionTrigger,
        reason: &str,
    ) -> Result<MigrationPlan> {
        let reason = reason.to_string();
        let plan = self
            .mutate_plan(namespace, move |plan| {
                Self::validate_transition(plan, to)?;
                plan.record_transition(to, trigger, reason.clone(), Utc::now());
                Ok(())
            })
            .await?;
        self.log_transition(namespace, &plan);
        Ok(plan)
    }

    fn validate_transition(plan: &MigrationPlan, to: MigrationPhase) -> Result<()> {
        if MigrationPhase::is_valid_transition(plan.phase, to) {
            Ok(())
        } else {
            Err(Error::invalid_transition(
                plan.phase,
                to,
                "transition not allowed from current phase",
            ))
        }
    }

    /// Loads, mutates, and saves a plan with one reload-retry on version
    /// conflict. The mutation re-runs against the reloaded plan so its
    /// guard is re-validated against fresh state.
    async fn mutate_plan<F>(&self, namespace: &Namespace, mutate: F) -> Result<MigrationPlan>
    where
        F: Fn(&mut MigrationPlan) -> Result<()>,
    {
        let mut plan = self.load_plan_required(namespace).await?;
        mutate(&mut plan)?;
        match self.store.save_plan(&plan, plan.version).await? {
            SaveResult::Saved { version } => {
                plan.version = version;
                self.plans.apply(plan.clone());
                Ok(plan)
            }
            SaveResult::Conflict { current_version } => {
                debug!(
                    namespace = %namespace,
                    expected = plan.version,
                    current = current_version,
                    "plan save conflicted, reloading"
                );
                let mut plan = self.load_plan_required(namespace).await?;
                mutate(&mut plan)?;
                match self.store.save_plan(&plan, plan.version).await? {
                    SaveResult::Saved { version } => {
                        plan.version = version;
                        self.plans.apply(plan.clone());
                        Ok(plan)
                    }
                    SaveResult::Conflict { current_version } => Err(Error::config_conflict(
                        namespace,
                        format!("plan save conflicted twice (version {current_version})"),
                    )),
                }
            }
        }
    }

    async fn load_plan_required(&self, namespace: &Namespace) -> Result<MigrationPlan> {
        self.store
            .load_plan(namespace)
            .await?
            .ok_or_else(|| Error::plan_not_found(namespace))
    }

    fn log_transition(&self, namespace: &Namespace, plan: &MigrationPlan) {
        if let Some(t) = plan.transitions.last() {
            self.metrics
                .record_phase_transition(namespace, t.from, t.to, t.trigger);
            info!(
                namespace = %namespace,
                plan_id = %plan.plan_id,
                from = %t.from,
                to = %t.to,
                trigger = %t.trigger,
                reason = %t.reason,
                "phase transition"
            );
        }
    }

    /// Spawns the backfill task for a namespace unless one is already
    /// running or there is nothing left to copy.
    async fn ensure_backfill_armed(&self, plan: &MigrationPlan) -> Result<()> {
        let namespace = &plan.namespace;
        let cursor = self.store.load_cursor(namespace).await?;
        let completed = cursor
            .as_ref()
            .is_some_and(|c| c.plan_id == plan.plan_id && c.completed);
        if completed || plan.paused || plan.backfill_stalled {
            return Ok(());
        }

        let mut backfills = self.lock_backfills();
        if let Some(handle) = backfills.get(namespace) {
            if !handle.task.is_finished() {
                return Ok(());
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(&self.backfill);
        let task_stop = Arc::clone(&stop);
        let task_ns = namespace.clone();
        let task = tokio::spawn(async move {
            match engine.run(&task_ns, &task_stop).await {
                Ok(outcome) => {
                    debug!(namespace = %task_ns, ?outcome, "backfill task finished");
                }
                Err(err) => {
                    error!(namespace = %task_ns, error = %err, "backfill task failed");
                }
            }
        });
        backfills.insert(namespace.clone(), BackfillHandle { stop, task });
        info!(namespace = %namespace, "backfill armed");
        Ok(())
    }

    /// Tells a running backfill to stop at its next batch boundary.
    fn signal_backfill_stop(&self, namespace: &Namespace) {
        let backfills = self.lock_backfills();
        if let Some(handle) = backfills.get(namespace) {
            handle.stop.store(true, Ordering::Release);
        }
    }

    fn lock_backfills(&self) -> std::sync::MutexGuard<'_, HashMap<Namespace, BackfillHandle>> {
        self.backfills.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(items_copied: u64, expected_items: Option<u64>, completed: bool) -> Option<f64> {
        if completed {
            return Some(100.0);
        }
        match expected_items {
            Some(expected) if expected > 0 => {
                Some((items_copied as f64 / expected as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}
