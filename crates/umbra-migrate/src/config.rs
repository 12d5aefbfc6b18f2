//! Runtime configuration for the migration engine.
//!
//! Everything here deserializes with sensible defaults, so a deployment can
//! start from an empty config block and override only what it needs. Plan
//! thresholds are configured per namespace on the
//! [`MigrationPlan`](umbra_core::MigrationPlan); this module covers the
//! process-wide knobs: retry policy, pool sizing, backfill pacing, and the
//! orchestrator's reconfiguration cadence.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the migration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Shadow-write retry policy.
    #[serde(default)]
    pub shadow_write: ShadowWriteConfig,

    /// Shadow worker pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Backfill batching and pacing.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Sliding-window sizing for decision metrics.
    #[serde(default)]
    pub windows: WindowConfig,

    /// Orchestrator cadence and backend deadlines.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Retry policy for asynchronous shadow writes and shadow reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowWriteConfig {
    /// Total attempts per shadow operation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles per attempt after.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any single backoff sleep.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_backoff_base_ms() -> u64 {
    50
}

const fn default_backoff_cap_ms() -> u64 {
    5_000
}

impl Default for ShadowWriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl ShadowWriteConfig {
    /// Backoff sleep before the given retry (attempt is 1-based; attempt 1
    /// is the initial try and never sleeps).
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1_u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Sizing for the bounded shadow worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum queued jobs; beyond this the oldest pending job is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_workers() -> usize {
    4
}

const fn default_queue_capacity() -> usize {
    1_024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Batching and pacing for the backfill engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Items per scan batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sustained copy throughput ceiling, in items per second.
    #[serde(default = "default_max_items_per_sec")]
    pub max_items_per_sec: u32,

    /// Consecutive batch failures before the engine halts and marks the
    /// plan stalled.
    #[serde(default = "default_stall_after_failures")]
    pub stall_after_failures: u32,
}

const fn default_batch_size() -> usize {
    1_000
}

const fn default_max_items_per_sec() -> u32 {
    5_000
}

const fn default_stall_after_failures() -> u32 {
    5
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_items_per_sec: default_max_items_per_sec(),
            stall_after_failures: default_stall_after_failures(),
        }
    }
}

/// Sizing for the sliding windows behind automatic transition decisions.
///
/// Retention must cover the longest window any plan threshold asks for;
/// the defaults cover the 7-day decommission confidence period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Width of one counter bucket.
    #[serde(default = "default_slot_width_secs")]
    pub slot_width_secs: u64,

    /// How far back windowed queries can reach.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

const fn default_slot_width_secs() -> u64 {
    300
}

const fn default_retention_secs() -> u64 {
    604_800
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            slot_width_secs: default_slot_width_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl WindowConfig {
    /// Width of one counter bucket, as a duration.
    #[must_use]
    pub const fn slot_width(&self) -> Duration {
        Duration::from_secs(self.slot_width_secs)
    }

    /// Retention horizon, as a duration.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Orchestrator cadence and backend call deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How often the supervisor re-evaluates guards and trip-wires.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Deadline applied to every backend operation.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// How many recent transitions a status query returns.
    #[serde(default = "default_status_transition_limit")]
    pub status_transition_limit: usize,
}

const fn default_tick_interval_secs() -> u64 {
    30
}

const fn default_op_timeout_ms() -> u64 {
    2_000
}

const fn default_status_transition_limit() -> usize {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            op_timeout_ms: default_op_timeout_ms(),
            status_transition_limit: default_status_transition_limit(),
        }
    }
}

impl OrchestratorConfig {
    /// Supervisor tick interval, as a duration.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Backend operation deadline, as a duration.
    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let config: MigrationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.shadow_write.max_attempts, 3);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.queue_capacity, 1024);
        assert_eq!(config.backfill.batch_size, 1000);
        assert_eq!(config.backfill.stall_after_failures, 5);
        assert_eq!(config.orchestrator.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.orchestrator.op_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: MigrationConfig =
            serde_json::from_str(r#"{"backfill": {"batch_size": 50}}"#).unwrap();
        assert_eq!(config.backfill.batch_size, 50);
        assert_eq!(config.backfill.max_items_per_sec, 5000);
        assert_eq!(config.shadow_write.backoff_base_ms, 50);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ShadowWriteConfig::default();
        assert_eq!(config.backoff_for_attempt(1), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(50));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(200));

        // Far enough out, the cap takes over.
        assert_eq!(config.backoff_for_attempt(12), Duration::from_millis(5000));
        assert_eq!(config.backoff_for_attempt(40), Duration::from_millis(5000));
    }

    #[test]
    fn window_defaults_cover_confidence_period() {
        let windows = WindowConfig::default();
        assert_eq!(windows.retention(), Duration::from_secs(604_800));
        assert!(windows.retention() >= Duration::from_secs(259_200));
    }
}
