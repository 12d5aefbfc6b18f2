//! Observability infrastructure for umbra.
//!
//! Structured logging with consistent spans. Every migration-facing log
//! line carries the namespace, and phase-changing operations carry the
//! plan ID, so one namespace's rollout can be followed end to end.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `umbra_migrate=debug`)
///
/// # Example
///
/// ```rust
/// use umbra_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for traffic-path operations (gate puts, comparator gets).
///
/// # Example
///
/// ```rust
/// use umbra_core::observability::traffic_span;
///
/// let span = traffic_span("put", "user-profiles");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn traffic_span(operation: &str, namespace: &str) -> Span {
    tracing::info_span!("traffic", op = operation, namespace = namespace)
}

/// Creates a span for migration control operations.
///
/// # Example
///
/// ```rust
/// use umbra_core::observability::migration_span;
///
/// let span = migration_span("promote", "user-profiles", "01J8ZQ6G9M3W9X4N2P5R7T0V1B");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn migration_span(operation: &str, namespace: &str, plan_id: &str) -> Span {
    tracing::info_span!(
        "migration",
        op = operation,
        namespace = namespace,
        plan_id = plan_id,
    )
}
