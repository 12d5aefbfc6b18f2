//! # umbra-migrate
//!
//! The migration engine for the umbra shadow migration orchestrator.
//!
//! This crate layers the moving parts of a zero-downtime migration on top
//! of the contracts in `umbra-core`:
//!
//! - **Dual-Write Gate**: Synchronous primary writes with asynchronous,
//!   best-effort mirroring to the shadow
//! - **Backfill Engine**: Resumable, rate-limited bulk copy driven by a
//!   durable cursor
//! - **Shadow-Read Comparator**: Sampled read comparison with redacting,
//!   field-level mismatch reporting
//! - **Orchestrator**: The phase machine, trip-wires, metric-gated
//!   automatic advances, and the operator command surface
//! - **Metrics**: Sliding-window counters that both feed dashboards and
//!   gate phase transitions
//!
//! ## Safety Posture
//!
//! The shadow backend is never load-bearing before promotion: shadow
//! write failures and comparison mismatches are recorded, never
//! surfaced to callers. Every phase change is a versioned save against
//! the config store, so two orchestrators cannot both win a transition.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use umbra_core::prelude::*;
//! use umbra_migrate::prelude::*;
//!
//! # async fn demo() -> umbra_migrate::error::Result<()> {
//! let mut registry = BackendRegistry::new();
//! registry.insert("legacy", Arc::new(MemoryBackend::new("legacy")) as _);
//! registry.insert("target", Arc::new(MemoryBackend::new("target")) as _);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backfill;
pub mod comparator;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod orchestrator;
pub mod plan_cache;
pub mod pool;
pub mod probe;
pub mod registry;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use umbra_migrate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backfill::{BackfillEngine, BackfillOutcome};
    pub use crate::comparator::{
        compare_values, DiffSummary, FieldDiff, NoSensitiveFields, SensitivitySchema,
        ShadowReadComparator, StaticFieldSchema,
    };
    pub use crate::config::{
        BackfillConfig, MigrationConfig, OrchestratorConfig, PoolConfig, ShadowWriteConfig,
        WindowConfig,
    };
    pub use crate::error::{Error, Result};
    pub use crate::gate::DualWriteGate;
    pub use crate::metrics::{ComparisonRates, MetricsFeed, MigrationMetrics, WriteRates};
    pub use crate::orchestrator::{
        CreatePlan, MigrationOrchestrator, MigrationStatus, TickOutcome,
    };
    pub use crate::plan_cache::PlanCache;
    pub use crate::pool::{PoolJob, ShadowPool, SubmitOutcome};
    pub use crate::probe::{BackendProbe, ShadowProbe};
    pub use crate::registry::BackendRegistry;
}

pub use backfill::{BackfillEngine, BackfillOutcome};
pub use comparator::{
    compare_values, DiffSummary, FieldDiff, NoSensitiveFields, SensitivitySchema,
    ShadowReadComparator, StaticFieldSchema,
};
pub use config::{
    BackfillConfig, MigrationConfig, OrchestratorConfig, PoolConfig, ShadowWriteConfig,
    WindowConfig,
};
pub use error::{Error, Result};
pub use gate::DualWriteGate;
pub use metrics::{ComparisonRates, MetricsFeed, MigrationMetrics, WriteRates};
pub use orchestrator::{CreatePlan, MigrationOrchestrator, MigrationStatus, TickOutcome};
pub use plan_cache::PlanCache;
pub use pool::{PoolJob, ShadowPool, SubmitOutcome};
pub use probe::{BackendProbe, ShadowProbe};
pub use registry::BackendRegistry;
