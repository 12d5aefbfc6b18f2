//! Observability metrics for the migration engine.
//!
//! Two consumers share this module:
//!
//! - **Dashboards and alerting** receive Prometheus-compatible counters and
//!   gauges through the `metrics` crate facade.
//! - **The orchestrator** makes its automatic-transition and trip-wire
//!   decisions from sliding-window counters kept here, queried through the
//!   read-only [`MetricsFeed`] trait with an explicit `now` so guards are
//!   deterministic under test.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `umbra_shadow_writes_total` | Counter | `namespace`, `result` | Shadow write outcomes (success, error, dropped) |
//! | `umbra_shadow_reads_total` | Counter | `namespace`, `result` | Comparison outcomes (match, mismatch, error, skipped, dropped) |
//! | `umbra_backfill_items_copied_total` | Counter | `namespace` | Items copied by the backfill engine |
//! | `umbra_backfill_batches_total` | Counter | `namespace`, `result` | Backfill batch outcomes |
//! | `umbra_phase_transitions_total` | Counter | `namespace`, `from_phase`, `to_phase`, `trigger` | Plan phase changes |
//! | `umbra_shadow_pool_queue_depth` | Gauge | - | Jobs waiting in the shadow pool |
//! | `umbra_shadow_pool_dropped_total` | Counter | - | Jobs evicted by drop-oldest backpressure |
//! | `umbra_orchestrator_tick_duration_seconds` | Histogram | `namespace` | Supervisor tick processing time |
//!
//! ## Windows
//!
//! Sliding windows are bucketed rings: one slot per `slot_width` of wall
//! time, retained up to the configured horizon. Window edges round down to
//! slot boundaries, which is plenty for guards measured over hours or days.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use umbra_core::{MigrationPhase, Namespace, TransitionTrigger};

use crate::config::WindowConfig;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Shadow write outcomes.
    pub const SHADOW_WRITES_TOTAL: &str = "umbra_shadow_writes_total";
    /// Counter: Shadow read comparison outcomes.
    pub const SHADOW_READS_TOTAL: &str = "umbra_shadow_reads_total";
    /// Counter: Items copied by the backfill engine.
    pub const BACKFILL_ITEMS_COPIED_TOTAL: &str = "umbra_backfill_items_copied_total";
    /// Counter: Backfill batch outcomes.
    pub const BACKFILL_BATCHES_TOTAL: &str = "umbra_backfill_batches_total";
    /// Counter: Plan phase transitions.
    pub const PHASE_TRANSITIONS_TOTAL: &str = "umbra_phase_transitions_total";
    /// Gauge: Jobs waiting in the shadow pool.
    pub const POOL_QUEUE_DEPTH: &str = "umbra_shadow_pool_queue_depth";
    /// Counter: Jobs evicted by drop-oldest backpressure.
    pub const POOL_DROPPED_TOTAL: &str = "umbra_shadow_pool_dropped_total";
    /// Histogram: Supervisor tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "umbra_orchestrator_tick_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// The namespace a measurement belongs to.
    pub const NAMESPACE: &str = "namespace";
    /// Outcome (success, error, match, mismatch, skipped, dropped).
    pub const RESULT: &str = "result";
    /// Phase before a transition.
    pub const FROM_PHASE: &str = "from_phase";
    /// Phase after a transition.
    pub const TO_PHASE: &str = "to_phase";
    /// What caused a transition (operator, automatic, trip-wire).
    pub const TRIGGER: &str = "trigger";
}

/// Shadow-write outcome counts over a queried window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteRates {
    /// Shadow writes that eventually succeeded.
    pub success: u64,
    /// Shadow writes that exhausted retries or were dropped.
    pub error: u64,
}

impl WriteRates {
    /// Fraction of shadow writes that succeeded, or `None` when the window
    /// holds no observations (a guard cannot pass on no data).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success + self.error;
        if total == 0 {
            None
        } else {
            Some(self.success as f64 / total as f64)
        }
    }

    /// Fraction of shadow writes that failed, or `None` when the window
    /// holds no observations.
    #[must_use]
    pub fn error_rate(&self) -> Option<f64> {
        self.success_rate().map(|r| 1.0 - r)
    }
}

/// Read-comparison outcome counts over a queried window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComparisonRates {
    /// Comparisons where both sides agreed.
    pub matched: u64,
    /// Comparisons where the sides disagreed.
    pub mismatched: u64,
    /// Shadow reads that failed before a comparison could happen.
    pub errors: u64,
}

impl ComparisonRates {
    /// Fraction of completed comparisons that mismatched, or `None` when
    /// no comparison completed in the window. Shadow read errors are not
    /// comparisons and do not enter this rate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mismatch_rate(&self) -> Option<f64> {
        let total = self.matched + self.mismatched;
        if total == 0 {
            None
        } else {
            Some(self.mismatched as f64 / total as f64)
        }
    }
}

/// Read-only windowed queries the orchestrator makes its decisions from.
///
/// `now` is explicit on every call so guard evaluation is reproducible in
/// tests and never hides a clock read.
pub trait MetricsFeed: Send + Sync {
    /// Shadow-write outcomes for a namespace over the trailing window.
    fn shadow_write_rates(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WriteRates;

    /// Comparison outcomes for a namespace over the trailing window.
    fn comparison_rates(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> ComparisonRates;

    /// Items copied by the backfill over the trailing window.
    fn backfill_items_copied(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> u64;
}

/// One bucketed sliding-window counter.
#[derive(Debug)]
struct WindowCounter {
    slot_width_secs: i64,
    slots: Vec<Slot>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    bucket: i64,
    count: u64,
}

impl WindowCounter {
    fn new(config: &WindowConfig) -> Self {
        let slot_width_secs = i64::try_from(config.slot_width_secs.max(1)).unwrap_or(300);
        let retention_secs = i64::try_from(config.retention_secs.max(1)).unwrap_or(604_800);
        // One extra slot so the partially-filled current slot never evicts
        // the oldest slot still inside the retention horizon.
        let slot_count = usize::try_from(retention_secs / slot_width_secs + 1).unwrap_or(2017);
        Self {
            slot_width_secs,
            slots: vec![
                Slot {
                    bucket: i64::MIN,
                    count: 0,
                };
                slot_count.max(2)
            ],
        }
    }

    fn bucket_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.slot_width_secs)
    }

    fn record(&mut self, now: DateTime<Utc>, n: u64) {
        let bucket = self.bucket_of(now);
        let len = i64::try_from(self.slots.len()).unwrap_or(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = bucket.rem_euclid(len) as usize;
        let slot = &mut self.slots[idx];
        if slot.bucket != bucket {
            slot.bucket = bucket;
            slot.count = 0;
        }
        slot.count += n;
    }

    fn sum(&self, window: Duration, now: DateTime<Utc>) -> u64 {
        let now_bucket = self.bucket_of(now);
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        let cutoff_bucket = (now.timestamp() - window_secs).div_euclid(self.slot_width_secs);
        self.slots
            .iter()
            .filter(|s| s.bucket >= cutoff_bucket && s.bucket <= now_bucket)
            .map(|s| s.count)
            .sum()
    }
}

/// The windowed signals tracked per namespace.
#[derive(Debug)]
struct NamespaceWindows {
    write_success: WindowCounter,
    write_error: WindowCounter,
    read_match: WindowCounter,
    read_mismatch: WindowCounter,
    read_error: WindowCounter,
    backfill_items: WindowCounter,
}

impl NamespaceWindows {
    fn new(config: &WindowConfig) -> Self {
        Self {
            write_success: WindowCounter::new(config),
            write_error: WindowCounter::new(config),
            read_match: WindowCounter::new(config),
            read_mismatch: WindowCounter::new(config),
            read_error: WindowCounter::new(config),
            backfill_items: WindowCounter::new(config),
        }
    }
}

/// Recording surface for every migration component, plus the windowed
/// store backing [`MetricsFeed`].
///
/// Cheap to share behind an `Arc`; recording never fails and never blocks
/// the traffic path on anything but a short mutex. If the window lock was
/// poisoned by a panicking thread, the observation is dropped rather than
/// propagating a failure into a caller's write path.
#[derive(Debug)]
pub struct MigrationMetrics {
    window_config: WindowConfig,
    windows: Mutex<HashMap<Namespace, NamespaceWindows>>,
}

impl MigrationMetrics {
    /// Creates a metrics registry with the given window sizing.
    #[must_use]
    pub fn new(window_config: WindowConfig) -> Self {
        Self {
            window_config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn record_window(
        &self,
        namespace: &Namespace,
        now: DateTime<Utc>,
        n: u64,
        pick: impl FnOnce(&mut NamespaceWindows) -> &mut WindowCounter,
    ) {
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        let entry = windows
            .entry(namespace.clone())
            .or_insert_with(|| NamespaceWindows::new(&self.window_config));
        pick(entry).record(now, n);
    }

    fn sum_window(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
        pick: impl FnOnce(&NamespaceWindows) -> &WindowCounter,
    ) -> u64 {
        let Ok(windows) = self.windows.lock() else {
            return 0;
        };
        windows
            .get(namespace)
            .map_or(0, |entry| pick(entry).sum(window, now))
    }

    /// Records a shadow write that eventually succeeded.
    pub fn record_shadow_write_success(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_WRITES_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "success",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.write_success);
    }

    /// Records a shadow write that exhausted its retries.
    pub fn record_shadow_write_error(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_WRITES_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "error",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.write_error);
    }

    /// Records a shadow write evicted from a saturated pool. Counts as a
    /// failure for guard purposes.
    pub fn record_shadow_write_dropped(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_WRITES_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "dropped",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.write_error);
    }

    /// Records a sampled comparison where both sides agreed.
    pub fn record_read_match(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_READS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "match",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.read_match);
    }

    /// Records a sampled comparison where the sides disagreed.
    pub fn record_read_mismatch(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_READS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "mismatch",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.read_mismatch);
    }

    /// Records a shadow read that failed before it could be compared.
    pub fn record_read_error(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_READS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "error",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.read_error);
    }

    /// Records a comparison job evicted from a saturated pool. Counts as a
    /// read error, not as a mismatch.
    pub fn record_read_dropped(&self, namespace: &Namespace, now: DateTime<Utc>) {
        counter!(
            names::SHADOW_READS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "dropped",
        )
        .increment(1);
        self.record_window(namespace, now, 1, |w| &mut w.read_error);
    }

    /// Records a read the sampler chose not to compare.
    pub fn record_read_skipped(&self, namespace: &Namespace) {
        counter!(
            names::SHADOW_READS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => "skipped",
        )
        .increment(1);
    }

    /// Records items copied by one backfill batch.
    pub fn record_backfill_items(&self, namespace: &Namespace, count: u64, now: DateTime<Utc>) {
        counter!(
            names::BACKFILL_ITEMS_COPIED_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
        )
        .increment(count);
        self.record_window(namespace, now, count, |w| &mut w.backfill_items);
    }

    /// Records a backfill batch outcome.
    pub fn record_backfill_batch(&self, namespace: &Namespace, result: &str) {
        counter!(
            names::BACKFILL_BATCHES_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a plan phase transition.
    pub fn record_phase_transition(
        &self,
        namespace: &Namespace,
        from: MigrationPhase,
        to: MigrationPhase,
        trigger: TransitionTrigger,
    ) {
        counter!(
            names::PHASE_TRANSITIONS_TOTAL,
            labels::NAMESPACE => namespace.to_string(),
            labels::FROM_PHASE => from.to_string(),
            labels::TO_PHASE => to.to_string(),
            labels::TRIGGER => trigger.to_string(),
        )
        .increment(1);
    }

    /// Updates the shadow pool queue depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pool_queue_depth(&self, depth: usize) {
        gauge!(names::POOL_QUEUE_DEPTH).set(depth as f64);
    }

    /// Records a job evicted by drop-oldest backpressure.
    pub fn record_pool_dropped(&self) {
        counter!(names::POOL_DROPPED_TOTAL).increment(1);
    }

    /// Records how long one supervisor tick took.
    pub fn observe_tick_duration(&self, namespace: &Namespace, duration: Duration) {
        histogram!(
            names::TICK_DURATION_SECONDS,
            labels::NAMESPACE => namespace.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

impl MetricsFeed for MigrationMetrics {
    fn shadow_write_rates(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> WriteRates {
        WriteRates {
            success: self.sum_window(namespace, window, now, |w| &w.write_success),
            error: self.sum_window(namespace, window, now, |w| &w.write_error),
        }
    }

    fn comparison_rates(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> ComparisonRates {
        ComparisonRates {
            matched: self.sum_window(namespace, window, now, |w| &w.read_match),
            mismatched: self.sum_window(namespace, window, now, |w| &w.read_mismatch),
            errors: self.sum_window(namespace, window, now, |w| &w.read_error),
        }
    }

    fn backfill_items_copied(
        &self,
        namespace: &Namespace,
        window: Duration,
        now: DateTime<Utc>,
    ) -> u64 {
        self.sum_window(namespace, window, now, |w| &w.backfill_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ns(s: &str) -> Namespace {
        Namespace::new(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn small_windows() -> WindowConfig {
        WindowConfig {
            slot_width_secs: 10,
            retention_secs: 100,
        }
    }

    #[test]
    fn window_counter_sums_recent_slots() {
        let mut counter = WindowCounter::new(&small_windows());
        counter.record(at(5), 3);
        counter.record(at(15), 4);
        counter.record(at(25), 5);

        assert_eq!(counter.sum(Duration::from_secs(100), at(25)), 12);
        // A 10s window at t=25 reaches back to t=15, which rounds down to
        // the slot starting at 10.
        assert_eq!(counter.sum(Duration::from_secs(10), at(25)), 9);
    }

    #[test]
    fn window_counter_expires_old_slots() {
        let mut counter = WindowCounter::new(&small_windows());
        counter.record(at(5), 100);

        // Far enough in the future the old slot is outside any window.
        assert_eq!(counter.sum(Duration::from_secs(50), at(500)), 0);

        // Recording at a time that reuses the ring index resets the slot.
        counter.record(at(505), 7);
        assert_eq!(counter.sum(Duration::from_secs(50), at(505)), 7);
    }

    #[test]
    fn writes_and_drops_feed_the_error_side() {
        let metrics = MigrationMetrics::new(small_windows());
        let orders = ns("orders");
        let now = at(50);

        metrics.record_shadow_write_success(&orders, now);
        metrics.record_shadow_write_success(&orders, now);
        metrics.record_shadow_write_error(&orders, now);
        metrics.record_shadow_write_dropped(&orders, now);

        let rates = metrics.shadow_write_rates(&orders, Duration::from_secs(60), now);
        assert_eq!(rates.success, 2);
        assert_eq!(rates.error, 2);
        assert_eq!(rates.success_rate(), Some(0.5));
        assert_eq!(rates.error_rate(), Some(0.5));
    }

    #[test]
    fn empty_window_yields_no_rate() {
        let metrics = MigrationMetrics::new(small_windows());
        let rates = metrics.shadow_write_rates(&ns("orders"), Duration::from_secs(60), at(50));
        assert_eq!(rates.success_rate(), None);

        let cmp = metrics.comparison_rates(&ns("orders"), Duration::from_secs(60), at(50));
        assert_eq!(cmp.mismatch_rate(), None);
    }

    #[test]
    fn mismatch_rate_ignores_read_errors() {
        let metrics = MigrationMetrics::new(small_windows());
        let orders = ns("orders");
        let now = at(50);

        metrics.record_read_match(&orders, now);
        metrics.record_read_match(&orders, now);
        metrics.record_read_match(&orders, now);
        metrics.record_read_mismatch(&orders, now);
        metrics.record_read_error(&orders, now);
        metrics.record_read_dropped(&orders, now);

        let cmp = metrics.comparison_rates(&orders, Duration::from_secs(60), now);
        assert_eq!(cmp.matched, 3);
        assert_eq!(cmp.mismatched, 1);
        assert_eq!(cmp.errors, 2);
        assert_eq!(cmp.mismatch_rate(), Some(0.25));
    }

    #[test]
    fn backfill_items_accumulate_in_window() {
        let metrics = MigrationMetrics::new(small_windows());
        let orders = ns("orders");

        metrics.record_backfill_items(&orders, 1000, at(10));
        metrics.record_backfill_items(&orders, 500, at(20));

        assert_eq!(
            metrics.backfill_items_copied(&orders, Duration::from_secs(60), at(20)),
            1500
        );
    }

    #[test]
    fn namespaces_do_not_share_windows() {
        let metrics = MigrationMetrics::new(small_windows());
        let now = at(50);
        metrics.record_shadow_write_error(&ns("orders"), now);

        let rates = metrics.shadow_write_rates(&ns("users"), Duration::from_secs(60), now);
        assert_eq!(rates.error, 0);
        assert_eq!(rates.success_rate(), None);
    }

    #[test]
    fn facade_calls_without_recorder_do_not_panic() {
        let metrics = MigrationMetrics::default();
        let orders = ns("orders");
        metrics.record_read_skipped(&orders);
        metrics.record_backfill_batch(&orders, "success");
        metrics.record_phase_transition(
            &orders,
            MigrationPhase::Idle,
            MigrationPhase::ShadowWrite,
            TransitionTrigger::Operator,
        );
        metrics.set_pool_queue_depth(3);
        metrics.record_pool_dropped();
        metrics.observe_tick_duration(&orders, Duration::from_millis(5));
    }
}
