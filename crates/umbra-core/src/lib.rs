//! # umbra-core
//!
//! Core abstractions for the umbra shadow migration orchestrator.
//!
//! This crate provides the foundational types and traits used across all
//! umbra components:
//!
//! - **Namespaces**: Validated identifiers for migrated datasets
//! - **Backend Contract**: The key-value trait both migration sides implement
//! - **Config Store**: Versioned persistence for plans and cursors
//! - **Plan Model**: Phases, thresholds, cursors, and the transition audit trail
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `umbra-core` is the **only** crate allowed to define cross-component
//! contracts. The migration engine in `umbra-migrate` consumes these traits
//! and never reaches around them.
//!
//! ## Example
//!
//! ```rust
//! use umbra_core::prelude::*;
//!
//! let namespace = Namespace::new("user-profiles");
//! let plan_id = PlanId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod config_store;
pub mod error;
pub mod id;
pub mod namespace;
pub mod observability;
pub mod plan;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use umbra_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backend::{KeyValue, KeyValueBackend, MemoryBackend, ScanCursor, ScanPage};
    pub use crate::config_store::{ConfigStore, MemoryConfigStore, SaveResult};
    pub use crate::error::{Error, Result};
    pub use crate::id::PlanId;
    pub use crate::namespace::Namespace;
    pub use crate::plan::{
        BackendRef, BackfillCursor, MigrationPhase, MigrationPlan, PhaseThresholds,
        PhaseTransition, TransitionTrigger,
    };
}

// Re-export key types at crate root for ergonomics
pub use backend::{KeyValue, KeyValueBackend, MemoryBackend, ScanCursor, ScanPage};
pub use config_store::{ConfigStore, MemoryConfigStore, SaveResult};
pub use error::{Error, Result};
pub use id::PlanId;
pub use namespace::Namespace;
pub use observability::{LogFormat, init_logging};
pub use plan::{
    BackendRef, BackfillCursor, MigrationPhase, MigrationPlan, PhaseThresholds, PhaseTransition,
    TransitionTrigger,
};
