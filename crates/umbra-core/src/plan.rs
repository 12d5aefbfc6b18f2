//! Durable migration state: plans, phases, cursors, and the audit trail.
//!
//! A [`MigrationPlan`] is the single source of truth for one namespace's
//! migration. It is persisted in the config store with optimistic
//! concurrency and carries the phase, the primary/shadow backend bindings,
//! sampling and threshold policy, and an append-only record of every phase
//! transition. The [`BackfillCursor`] is a separate durable record owned by
//! the backfill engine, so high-frequency cursor saves never contend with
//! operator commands on the plan itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::backend::ScanCursor;
use crate::error::{Error, Result};
use crate::id::PlanId;
use crate::namespace::Namespace;

/// Migration lifecycle phase.
///
/// Phases advance strictly forward except for the explicit rollback edge.
/// `RolledBack` is terminal until an operator starts a fresh pass;
/// `Decommissioned` is terminal, full stop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    /// Plan exists but nothing is mirrored yet.
    Idle,
    /// New writes are duplicated to the shadow backend.
    ShadowWrite,
    /// Historical data is being copied while dual writes continue.
    Backfilling,
    /// Reads are sampled and compared against the shadow.
    ShadowRead,
    /// The shadow has become the primary; the former primary is kept
    /// as a safety net.
    Promoted,
    /// The old backend has been retired.
    Decommissioned,
    /// The migration was aborted and the original primary restored.
    RolledBack,
}

impl MigrationPhase {
    /// All phases, in lifecycle order. Useful for exhaustive tests.
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::ShadowWrite,
        Self::Backfilling,
        Self::ShadowRead,
        Self::Promoted,
        Self::Decommissioned,
        Self::RolledBack,
    ];

    /// Returns true if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Decommissioned)
    }

    /// Returns true if writes are mirrored to the shadow in this phase.
    ///
    /// After promotion the bindings have been swapped, so mirroring keeps
    /// the former primary current during the safety period.
    #[must_use]
    pub const fn mirrors_writes(self) -> bool {
        matches!(
            self,
            Self::ShadowWrite | Self::Backfilling | Self::ShadowRead | Self::Promoted
        )
    }

    /// Returns true if reads are sampled for comparison in this phase.
    #[must_use]
    pub const fn samples_reads(self) -> bool {
        matches!(self, Self::ShadowRead | Self::Promoted)
    }

    /// Validates a phase transition.
    ///
    /// Rollback is reachable from every phase except `Decommissioned`
    /// (and itself); everything else moves one step forward.
    #[must_use]
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Idle | Self::RolledBack, Self::ShadowWrite)
                | (Self::ShadowWrite, Self::Backfilling)
                | (Self::Backfilling, Self::ShadowRead)
                | (Self::ShadowRead, Self::Promoted)
                | (Self::Promoted, Self::Decommissioned)
                | (
                    Self::Idle
                        | Self::ShadowWrite
                        | Self::Backfilling
                        | Self::ShadowRead
                        | Self::Promoted,
                    Self::RolledBack
                )
        )
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::ShadowWrite => "SHADOW_WRITE",
            Self::Backfilling => "BACKFILLING",
            Self::ShadowRead => "SHADOW_READ",
            Self::Promoted => "PROMOTED",
            Self::Decommissioned => "DECOMMISSIONED",
            Self::RolledBack => "ROLLED_BACK",
        };
        write!(f, "{s}")
    }
}

/// A named reference to a configured backend.
///
/// Plans store references rather than connection details; the runtime
/// resolves a reference to a live [`KeyValueBackend`](crate::KeyValueBackend)
/// through its registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(String);

impl BackendRef {
    /// Creates a backend reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What caused a phase transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionTrigger {
    /// An explicit operator command.
    Operator,
    /// A metrics-gated automatic advance.
    Automatic,
    /// A safety trip-wire forced a rollback.
    TripWire,
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Operator => "OPERATOR",
            Self::Automatic => "AUTOMATIC",
            Self::TripWire => "TRIP_WIRE",
        };
        write!(f, "{s}")
    }
}

/// One entry in a plan's append-only transition audit trail.
///
/// Stored inside the plan record so the trail is crash-consistent with the
/// phase itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseTransition {
    /// The phase before the transition.
    pub from: MigrationPhase,
    /// The phase after the transition.
    pub to: MigrationPhase,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
    /// What caused it.
    pub trigger: TransitionTrigger,
    /// Human-readable context (which guard passed, which wire tripped).
    pub reason: String,
}

/// Metric thresholds and windows gating automatic phase changes.
///
/// All rates are fractions in `[0.0, 1.0]`; windows and periods are in
/// seconds so the record stays serde-friendly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseThresholds {
    /// Minimum shadow-write success rate to auto-advance out of
    /// `ShadowWrite` (and to hold during `Backfilling`).
    #[serde(default = "default_write_success_min")]
    pub write_success_min: f64,
    /// Observation window for the write success rate.
    #[serde(default = "default_write_window_secs")]
    pub write_window_secs: u64,
    /// Maximum comparison mismatch rate to auto-advance out of
    /// `ShadowRead`.
    #[serde(default = "default_mismatch_max")]
    pub mismatch_max: f64,
    /// Observation window for the mismatch rate.
    #[serde(default = "default_mismatch_window_secs")]
    pub mismatch_window_secs: u64,
    /// Shadow-write error rate above which a rollback trips.
    #[serde(default = "default_tripwire_write_error_max")]
    pub tripwire_write_error_max: f64,
    /// Mismatch rate above which a rollback trips.
    #[serde(default = "default_tripwire_mismatch_max")]
    pub tripwire_mismatch_max: f64,
    /// How long `Promoted` must stay clean before decommission is allowed.
    #[serde(default = "default_confidence_period_secs")]
    pub confidence_period_secs: u64,
}

fn default_write_success_min() -> f64 {
    0.99
}

fn default_write_window_secs() -> u64 {
    86_400
}

fn default_mismatch_max() -> f64 {
    0.001
}

fn default_mismatch_window_secs() -> u64 {
    259_200
}

fn default_tripwire_write_error_max() -> f64 {
    0.5
}

fn default_tripwire_mismatch_max() -> f64 {
    0.05
}

fn default_confidence_period_secs() -> u64 {
    604_800
}

impl Default for PhaseThresholds {
    fn default() -> Self {
        Self {
            write_success_min: default_write_success_min(),
            write_window_secs: default_write_window_secs(),
            mismatch_max: default_mismatch_max(),
            mismatch_window_secs: default_mismatch_window_secs(),
            tripwire_write_error_max: default_tripwire_write_error_max(),
            tripwire_mismatch_max: default_tripwire_mismatch_max(),
            confidence_period_secs: default_confidence_period_secs(),
        }
    }
}

impl PhaseThresholds {
    /// Observation window for write success, as a duration.
    #[must_use]
    pub const fn write_window(&self) -> Duration {
        Duration::from_secs(self.write_window_secs)
    }

    /// Observation window for read comparison, as a duration.
    #[must_use]
    pub const fn mismatch_window(&self) -> Duration {
        Duration::from_secs(self.mismatch_window_secs)
    }

    /// Required clean period before decommission, as a duration.
    #[must_use]
    pub const fn confidence_period(&self) -> Duration {
        Duration::from_secs(self.confidence_period_secs)
    }
}

/// The durable record describing one namespace's migration.
///
/// Exactly one live plan exists per namespace. The orchestrator is the only
/// writer of `phase`; the backfill engine is the only writer of
/// `backfill_stalled`. Every save goes through the config store's
/// optimistic concurrency, which bumps `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPlan {
    /// Unique identity of this migration pass.
    pub plan_id: PlanId,
    /// The namespace being migrated.
    pub namespace: Namespace,
    /// The backend currently serving reads and authoritative writes.
    pub primary: BackendRef,
    /// The backend being migrated to (or, after promotion, the safety
    /// copy being migrated from).
    pub shadow: BackendRef,
    /// Current lifecycle phase.
    pub phase: MigrationPhase,
    /// Fraction of reads compared against the shadow while the phase
    /// samples reads.
    pub sample_rate: f64,
    /// Thresholds gating automatic transitions and trip-wires.
    #[serde(default)]
    pub thresholds: PhaseThresholds,
    /// Operator hold: automatic transitions and trip-wires are suspended.
    #[serde(default)]
    pub paused: bool,
    /// Set by the backfill engine after repeated batch failures; cleared
    /// by the operator `resume` command.
    #[serde(default)]
    pub backfill_stalled: bool,
    /// Operator estimate of total items, for progress reporting.
    #[serde(default)]
    pub expected_items: Option<u64>,
    /// Append-only audit trail of every phase change.
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
    /// Optimistic concurrency version; 0 until first saved.
    #[serde(default)]
    pub version: u64,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// When the plan was last saved.
    pub updated_at: DateTime<Utc>,
}

impl MigrationPlan {
    /// Creates a new plan in the `Idle` phase.
    ///
    /// # Errors
    ///
    /// Returns an error if `sample_rate` is outside `[0.0, 1.0]` or the
    /// primary and shadow references are the same backend.
    pub fn new(
        namespace: Namespace,
        primary: BackendRef,
        shadow: BackendRef,
        sample_rate: f64,
        thresholds: PhaseThresholds,
        expected_items: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(Error::invalid_input(format!(
                "sample rate {sample_rate} is outside [0.0, 1.0]"
            )));
        }
        if primary == shadow {
            return Err(Error::invalid_input(format!(
                "primary and shadow must differ, both are '{primary}'"
            )));
        }
        Ok(Self {
            plan_id: PlanId::generate(),
            namespace,
            primary,
            shadow,
            phase: MigrationPhase::Idle,
            sample_rate,
            thresholds,
            paused: false,
            backfill_stalled: false,
            expected_items,
            transitions: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies a phase transition and appends it to the audit trail.
    ///
    /// Callers must validate the edge with
    /// [`MigrationPhase::is_valid_transition`] first; this method records
    /// whatever it is given.
    pub fn record_transition(
        &mut self,
        to: MigrationPhase,
        trigger: TransitionTrigger,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: now,
            trigger,
            reason: reason.into(),
        });
        self.phase = to;
        self.updated_at = now;
    }

    /// Swaps the primary and shadow bindings.
    ///
    /// Called at promotion, and again if a rollback needs to undo a
    /// promotion.
    pub fn swap_bindings(&mut self) {
        std::mem::swap(&mut self.primary, &mut self.shadow);
    }

    /// Returns the most recent transitions, newest last, capped at `n`.
    #[must_use]
    pub fn recent_transitions(&self, n: usize) -> &[PhaseTransition] {
        let start = self.transitions.len().saturating_sub(n);
        &self.transitions[start..]
    }

    /// When the plan entered its current phase, or `created_at` if it has
    /// never transitioned.
    #[must_use]
    pub fn phase_entered_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map_or(self.created_at, |t| t.at)
    }
}

/// Durable backfill position for one namespace.
///
/// Owned exclusively by the backfill engine. Created when the plan enters
/// `Backfilling` and retained after completion; `completed` is the sole
/// gate for advancing to `ShadowRead`. The `plan_id` ties the cursor to
/// the migration pass that produced it, so a cursor left over from an
/// earlier rolled-back pass is never mistaken for progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillCursor {
    /// The namespace being backfilled.
    pub namespace: Namespace,
    /// The migration pass this cursor belongs to.
    pub plan_id: PlanId,
    /// Opaque resume position; `None` means the scan has not started.
    pub position: Option<ScanCursor>,
    /// Total items copied so far.
    pub items_copied: u64,
    /// True once a scan pass has drained the primary.
    pub completed: bool,
    /// Optimistic concurrency version; 0 until first saved.
    #[serde(default)]
    pub version: u64,
    /// When the cursor was last saved.
    pub updated_at: DateTime<Utc>,
}

impl BackfillCursor {
    /// Creates a fresh cursor at the start of a namespace.
    #[must_use]
    pub fn new(namespace: Namespace, plan_id: PlanId, now: DateTime<Utc>) -> Self {
        Self {
            namespace,
            plan_id,
            position: None,
            items_copied: 0,
            completed: false,
            version: 0,
            updated_at: now,
        }
    }

    /// Advances the cursor past a copied batch.
    pub fn advance(
        &mut self,
        position: Option<ScanCursor>,
        copied: u64,
        now: DateTime<Utc>,
    ) {
        self.position = position;
        self.items_copied += copied;
        self.updated_at = now;
    }

    /// Marks the scan as having drained the primary.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.updated_at = now;
    }
}
