//! Sampled shadow-read comparison.
//!
//! The read path always answers from the primary backend. While the plan is
//! in a read-sampling phase, a per-request coin flip at `sample_rate`
//! dispatches an equivalent shadow read to the [`ShadowPool`], carrying the
//! primary's value along so the comparison never re-reads the primary.
//!
//! Values are compared byte-for-byte, except when both sides parse as JSON
//! objects: then the comparison is field-by-field, so re-serialization
//! differences (key order, whitespace) do not count as divergence. Mismatch
//! logs carry a [`DiffSummary`] only; values of fields the namespace's
//! schema marks sensitive are replaced with `REDACTED` before they reach a
//! log line.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use umbra_core::{KeyValueBackend, Namespace};

use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use crate::plan_cache::PlanCache;
use crate::pool::{PoolJob, ShadowPool};
use crate::registry::BackendRegistry;

/// Most differing fields a [`DiffSummary`] names before truncating.
const MAX_DIFF_FIELDS: usize = 8;

/// Longest rendered field value carried in a diff; larger values are
/// replaced by a length marker.
const MAX_VALUE_CHARS: usize = 64;

/// Marks fields whose values must never appear in logs.
///
/// Namespaces that move structured payloads carry schema metadata naming
/// credential-bearing fields; the comparator consults it before rendering
/// a field value into a [`DiffSummary`].
pub trait SensitivitySchema: Send + Sync + 'static {
    /// Returns true when `field` in `namespace` holds a sensitive value.
    fn is_sensitive(&self, namespace: &Namespace, field: &str) -> bool;
}

/// Schema that marks nothing sensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSensitiveFields;

impl SensitivitySchema for NoSensitiveFields {
    fn is_sensitive(&self, _namespace: &Namespace, _field: &str) -> bool {
        false
    }
}

/// Fixed field list applied to every namespace, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticFieldSchema {
    fields: BTreeSet<String>,
}

impl StaticFieldSchema {
    /// Builds a schema from field names; matching ignores ASCII case.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl SensitivitySchema for StaticFieldSchema {
    fn is_sensitive(&self, _namespace: &Namespace, field: &str) -> bool {
        self.fields.contains(&field.to_ascii_lowercase())
    }
}

/// One differing field in a JSON comparison, already redaction-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    /// Top-level field name.
    pub field: String,
    /// Rendered primary-side value, `REDACTED` or a length marker.
    pub primary: String,
    /// Rendered shadow-side value, `REDACTED` or a length marker.
    pub shadow: String,
}

/// Compact, log-safe description of how primary and shadow disagreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSummary {
    /// The key exists on one side only.
    Presence {
        /// Whether the primary returned a value.
        primary: bool,
        /// Whether the shadow returned a value.
        shadow: bool,
    },
    /// Both sides are JSON objects and these top-level fields differ.
    Fields {
        /// Differing fields, capped at [`MAX_DIFF_FIELDS`].
        diffs: Vec<FieldDiff>,
        /// How many further differing fields were truncated away.
        truncated: usize,
    },
    /// Raw byte mismatch between non-JSON (or non-object) values.
    Bytes {
        /// Primary value length in bytes.
        primary_len: usize,
        /// Shadow value length in bytes.
        shadow_len: usize,
    },
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence { primary, shadow } => {
                write!(f, "presence primary={primary} shadow={shadow}")
            }
            Self::Fields { diffs, truncated } => {
                for (i, diff) in diffs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {} != {}", diff.field, diff.primary, diff.shadow)?;
                }
                if *truncated > 0 {
                    write!(f, ", +{truncated} more")?;
                }
                Ok(())
            }
            Self::Bytes {
                primary_len,
                shadow_len,
            } => write!(
                f,
                "byte mismatch (primary {primary_len} bytes, shadow {shadow_len} bytes)"
            ),
        }
    }
}

/// Compares the two sides of a sampled read.
///
/// Returns `None` when the values agree, otherwise a redaction-safe
/// summary of the divergence.
#[must_use]
pub fn compare_values(
    namespace: &Namespace,
    primary: Option<&Bytes>,
    shadow: Option<&Bytes>,
    schema: &dyn SensitivitySchema,
) -> Option<DiffSummary> {
    let (primary, shadow) = match (primary, shadow) {
        (None, None) => return None,
        (Some(p), Some(s)) => (p, s),
        (p, s) => {
            return Some(DiffSummary::Presence {
                primary: p.is_some(),
                shadow: s.is_some(),
            })
        }
    };

    if primary == shadow {
        return None;
    }

    if let (Ok(Value::Object(p)), Ok(Value::Object(s))) = (
        serde_json::from_slice::<Value>(primary),
        serde_json::from_slice::<Value>(shadow),
    ) {
        let mut fields: BTreeSet<&str> = p.keys().map(String::as_str).collect();
        fields.extend(s.keys().map(String::as_str));

        let mut diffs = Vec::new();
        let mut truncated = 0;
        for field in fields {
            if p.get(field) == s.get(field) {
                continue;
            }
            if diffs.len() == MAX_DIFF_FIELDS {
                truncated += 1;
                continue;
            }
            let sensitive = schema.is_sensitive(namespace, field);
            diffs.push(FieldDiff {
                field: field.to_string(),
                primary: render_field(p.get(field), sensitive),
                shadow: render_field(s.get(field), sensitive),
            });
        }

        if diffs.is_empty() && truncated == 0 {
            // Same object, different serialization.
            return None;
        }
        return Some(DiffSummary::Fields { diffs, truncated });
    }

    Some(DiffSummary::Bytes {
        primary_len: primary.len(),
        shadow_len: shadow.len(),
    })
}

fn render_field(value: Option<&Value>, sensitive: bool) -> String {
    let Some(value) = value else {
        return "absent".to_string();
    };
    if sensitive {
        return "REDACTED".to_string();
    }
    let rendered = value.to_string();
    if rendered.len() > MAX_VALUE_CHARS {
        return format!("<{} bytes>", rendered.len());
    }
    rendered
}

/// One asynchronous shadow read plus comparison against the primary value
/// captured at sampling time.
struct CompareJob {
    namespace: Namespace,
    key: String,
    primary: Option<Bytes>,
    backend: Arc<dyn KeyValueBackend>,
    schema: Arc<dyn SensitivitySchema>,
    op_timeout: Duration,
    metrics: Arc<MigrationMetrics>,
}

#[async_trait]
impl PoolJob for CompareJob {
    async fn run(self: Box<Self>) {
        let shadow = match self
            .backend
            .get(&self.namespace, &self.key, self.op_timeout)
            .await
        {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    key = %self.key,
                    backend = self.backend.name(),
                    error = %err,
                    "shadow read failed"
                );
                self.metrics.record_read_error(&self.namespace, Utc::now());
                return;
            }
        };

        match compare_values(
            &self.namespace,
            self.primary.as_ref(),
            shadow.as_ref(),
            self.schema.as_ref(),
        ) {
            None => self.metrics.record_read_match(&self.namespace, Utc::now()),
            Some(diff) => {
                warn!(
                    namespace = %self.namespace,
                    key = %self.key,
                    diff = %diff,
                    "shadow read mismatch"
                );
                self.metrics
                    .record_read_mismatch(&self.namespace, Utc::now());
            }
        }
    }

    fn abandon(self: Box<Self>) {
        debug!(
            namespace = %self.namespace,
            key = %self.key,
            "shadow read dropped by pool backpressure"
        );
        self.metrics.record_read_dropped(&self.namespace, Utc::now());
    }
}

/// The read path: primary reads with sampled shadow comparison.
pub struct ShadowReadComparator {
    plans: Arc<PlanCache>,
    registry: Arc<BackendRegistry>,
    pool: Arc<ShadowPool>,
    metrics: Arc<MigrationMetrics>,
    schema: Arc<dyn SensitivitySchema>,
    op_timeout: Duration,
}

impl fmt::Debug for ShadowReadComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowReadComparator")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl ShadowReadComparator {
    /// Creates a comparator over the shared runtime pieces.
    #[must_use]
    pub fn new(
        plans: Arc<PlanCache>,
        registry: Arc<BackendRegistry>,
        pool: Arc<ShadowPool>,
        metrics: Arc<MigrationMetrics>,
        schema: Arc<dyn SensitivitySchema>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            plans,
            registry,
            pool,
            metrics,
            schema,
            op_timeout,
        }
    }

    /// Reads a value through the migration.
    ///
    /// The answer always comes from the primary backend, whatever the
    /// comparison later finds. In a read-sampling phase a fraction of
    /// requests, drawn per call at the plan's `sample_rate`, also queue a
    /// shadow read for comparison.
    ///
    /// # Errors
    ///
    /// Returns the primary backend's error, or
    /// [`Error::PlanNotFound`] when the namespace has no plan.
    pub async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Bytes>> {
        let plan = self
            .plans
            .current(namespace)
            .ok_or_else(|| Error::plan_not_found(namespace))?;
        let primary = self.registry.resolve(&plan.primary)?;

        let value = primary.get(namespace, key, self.op_timeout).await?;

        if plan.phase.samples_reads() {
            if rand::random::<f64>() < plan.sample_rate {
                self.sample(namespace, key, value.clone(), &plan.shadow);
            } else {
                self.metrics.record_read_skipped(namespace);
            }
        }

        Ok(value)
    }

    fn sample(
        &self,
        namespace: &Namespace,
        key: &str,
        primary: Option<Bytes>,
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
                    "shadow backend unresolvable, counting read as failed"
                );
                self.metrics.record_read_error(namespace, Utc::now());
                return;
            }
        };

        self.pool.submit(Box::new(CompareJob {
            namespace: namespace.clone(),
            key: key.to_string(),
            primary,
            backend,
            schema: Arc::clone(&self.schema),
            op_timeout: self.op_timeout,
            metrics: Arc::clone(&self.metrics),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, WindowConfig};
    use crate::metrics::MetricsFeed;
    use umbra_core::{
        BackendRef, ConfigStore, MemoryBackend, MemoryConfigStore, MigrationPhase, MigrationPlan,
        PhaseThresholds, TransitionTrigger,
    };

    const WINDOW: Duration = Duration::from_secs(3600);
    const DEADLINE: Duration = Duration::from_secs(1);

    fn ns() -> Namespace {
        Namespace::new("profiles").unwrap()
    }

    #[test]
    fn equal_bytes_match() {
        let a = Bytes::from_static(b"hello");
        assert_eq!(
            compare_values(&ns(), Some(&a), Some(&a), &NoSensitiveFields),
            None
        );
    }

    #[test]
    fn both_absent_match() {
        assert_eq!(compare_values(&ns(), None, None, &NoSensitiveFields), None);
    }

    #[test]
    fn presence_mismatch_is_reported() {
        let a = Bytes::from_static(b"hello");
        let diff = compare_values(&ns(), Some(&a), None, &NoSensitiveFields).unwrap();
        assert_eq!(
            diff,
            DiffSummary::Presence {
                primary: true,
                shadow: false
            }
        );
    }

    #[test]
    fn json_key_order_does_not_mismatch() {
        let a = Bytes::from_static(br#"{"a":1,"b":2}"#);
        let b = Bytes::from_static(br#"{"b": 2, "a": 1}"#);
        assert_eq!(
            compare_values(&ns(), Some(&a), Some(&b), &NoSensitiveFields),
            None
        );
    }

    #[test]
    fn json_field_diff_names_fields() {
        let a = Bytes::from_static(br#"{"status":"open","total":10}"#);
        let b = Bytes::from_static(br#"{"status":"closed","total":10}"#);
        let diff = compare_values(&ns(), Some(&a), Some(&b), &NoSensitiveFields).unwrap();
        let DiffSummary::Fields { diffs, truncated } = diff else {
            panic!("expected field diff");
        };
        assert_eq!(truncated, 0);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "status");
        assert_eq!(diffs[0].primary, "\"open\"");
        assert_eq!(diffs[0].shadow, "\"closed\"");
    }

    #[test]
    fn missing_field_renders_absent() {
        let a = Bytes::from_static(br#"{"status":"open","extra":1}"#);
        let b = Bytes::from_static(br#"{"status":"open"}"#);
        let diff = compare_values(&ns(), Some(&a), Some(&b), &NoSensitiveFields).unwrap();
        let DiffSummary::Fields { diffs, .. } = diff else {
            panic!("expected field diff");
        };
        assert_eq!(diffs[0].field, "extra");
        assert_eq!(diffs[0].shadow, "absent");
    }

    #[test]
    fn sensitive_field_values_are_redacted() {
        let schema = StaticFieldSchema::new(["token"]);
        let a = Bytes::from_static(br#"{"token":"secret-a"}"#);
        let b = Bytes::from_static(br#"{"token":"secret-b"}"#);
        let diff = compare_values(&ns(), Some(&a), Some(&b), &schema).unwrap();
        let rendered = diff.to_string();
        assert!(rendered.contains("token: REDACTED != REDACTED"));
        assert!(!rendered.contains("secret-a"));
        assert!(!rendered.contains("secret-b"));
    }

    #[test]
    fn sensitive_matching_ignores_case() {
        let schema = StaticFieldSchema::new(["Token"]);
        assert!(schema.is_sensitive(&ns(), "TOKEN"));
        assert!(schema.is_sensitive(&ns(), "token"));
        assert!(!schema.is_sensitive(&ns(), "total"));
    }

    #[test]
    fn field_diff_is_capped() {
        let mut a = serde_json::Map::new();
        let mut b = serde_json::Map::new();
        for i in 0..12 {
            a.insert(format!("f{i:02}"), Value::from(1));
            b.insert(format!("f{i:02}"), Value::from(2));
        }
        let a = Bytes::from(serde_json::to_vec(&a).unwrap());
        let b = Bytes::from(serde_json::to_vec(&b).unwrap());
        let diff = compare_values(&ns(), Some(&a), Some(&b), &NoSensitiveFields).unwrap();
        assert!(diff.to_string().contains("+4 more"));
        let DiffSummary::Fields { diffs, truncated } = diff else {
            panic!("expected field diff");
        };
        assert_eq!(diffs.len(), MAX_DIFF_FIELDS);
        assert_eq!(truncated, 4);
    }

    #[test]
    fn non_json_mismatch_reports_lengths() {
        let a = Bytes::from_static(b"binary-one");
        let b = Bytes::from_static(b"two");
        let diff = compare_values(&ns(), Some(&a), Some(&b), &NoSensitiveFields).unwrap();
        assert_eq!(
            diff,
            DiffSummary::Bytes {
                primary_len: 10,
                shadow_len: 3
            }
        );
    }

    struct Fixture {
        comparator: ShadowReadComparator,
        pool: Arc<ShadowPool>,
        metrics: Arc<MigrationMetrics>,
        primary: Arc<MemoryBackend>,
        shadow: Arc<MemoryBackend>,
        ns: Namespace,
    }

    async fn fixture(phase: MigrationPhase, sample_rate: f64) -> Fixture {
        let ns = ns();
        let primary = Arc::new(MemoryBackend::new("primary"));
        let shadow = Arc::new(MemoryBackend::new("shadow"));

        let mut registry = BackendRegistry::new();
        registry.insert("primary", Arc::clone(&primary) as Arc<dyn KeyValueBackend>);
        registry.insert("shadow", Arc::clone(&shadow) as Arc<dyn KeyValueBackend>);

        let mut plan = MigrationPlan::new(
            ns.clone(),
            BackendRef::new("primary"),
            BackendRef::new("shadow"),
            sample_rate,
            PhaseThresholds::default(),
            None,
            Utc::now(),
        )
        .unwrap();
        if phase != MigrationPhase::Idle {
            plan.record_transition(phase, TransitionTrigger::Operator, "test", Utc::now());
        }

        let store = Arc::new(MemoryConfigStore::new());
        store.save_plan(&plan, 0).await.unwrap();
        let plans = Arc::new(PlanCache::new(store));
        plans.apply(plan);

        let metrics = Arc::new(MigrationMetrics::new(WindowConfig::default()));
        let pool = Arc::new(ShadowPool::start(
            &PoolConfig::default(),
            Arc::clone(&metrics),
        ));

        let comparator = ShadowReadComparator::new(
            plans,
            Arc::new(registry),
            Arc::clone(&pool),
            Arc::clone(&metrics),
            Arc::new(NoSensitiveFields),
            Duration::from_secs(1),
        );

        Fixture {
            comparator,
            pool,
            metrics,
            primary,
            shadow,
            ns,
        }
    }

    #[tokio::test]
    async fn divergent_shadow_counts_mismatch_and_returns_primary() {
        let fx = fixture(MigrationPhase::ShadowRead, 1.0).await;
        fx.primary
            .put(&fx.ns, "k1", Bytes::from_static(b"good"), DEADLINE)
            .await
            .unwrap();
        fx.shadow
            .put(&fx.ns, "k1", Bytes::from_static(b"bad"), DEADLINE)
            .await
            .unwrap();

        let value = fx.comparator.get(&fx.ns, "k1").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"good")));

        fx.pool.quiesce().await;
        let rates = fx.metrics.comparison_rates(&fx.ns, WINDOW, Utc::now());
        assert_eq!(rates.mismatched, 1);
        assert_eq!(rates.matched, 0);
    }

    #[tokio::test]
    async fn matching_shadow_counts_match() {
        let fx = fixture(MigrationPhase::Promoted, 1.0).await;
        fx.primary
            .put(&fx.ns, "k1", Bytes::from_static(b"same"), DEADLINE)
            .await
            .unwrap();
        fx.shadow
            .put(&fx.ns, "k1", Bytes::from_static(b"same"), DEADLINE)
            .await
            .unwrap();

        fx.comparator.get(&fx.ns, "k1").await.unwrap();
        fx.pool.quiesce().await;

        let rates = fx.metrics.comparison_rates(&fx.ns, WINDOW, Utc::now());
        assert_eq!(rates.matched, 1);
        assert_eq!(rates.mismatched, 0);
    }

    #[tokio::test]
    async fn zero_sample_rate_never_reads_shadow() {
        let fx = fixture(MigrationPhase::ShadowRead, 0.0).await;
        fx.primary
            .put(&fx.ns, "k1", Bytes::from_static(b"v"), DEADLINE)
            .await
            .unwrap();

        for _ in 0..20 {
            fx.comparator.get(&fx.ns, "k1").await.unwrap();
        }
        fx.pool.quiesce().await;

        let rates = fx.metrics.comparison_rates(&fx.ns, WINDOW, Utc::now());
        assert_eq!(rates.matched + rates.mismatched + rates.errors, 0);
    }

    #[tokio::test]
    async fn non_sampling_phase_ignores_sample_rate() {
        let fx = fixture(MigrationPhase::ShadowWrite, 1.0).await;
        fx.primary
            .put(&fx.ns, "k1", Bytes::from_static(b"v"), DEADLINE)
            .await
            .unwrap();

        fx.comparator.get(&fx.ns, "k1").await.unwrap();
        fx.pool.quiesce().await;

        let rates = fx.metrics.comparison_rates(&fx.ns, WINDOW, Utc::now());
        assert_eq!(rates.matched + rates.mismatched + rates.errors, 0);
    }

    #[tokio::test]
    async fn primary_miss_with_shadow_value_is_a_mismatch() {
        let fx = fixture(MigrationPhase::ShadowRead, 1.0).await;
        fx.shadow
            .put(&fx.ns, "ghost", Bytes::from_static(b"leftover"), DEADLINE)
            .await
            .unwrap();

        let value = fx.comparator.get(&fx.ns, "ghost").await.unwrap();
        assert_eq!(value, None);

        fx.pool.quiesce().await;
        let rates = fx.metrics.comparison_rates(&fx.ns, WINDOW, Utc::now());
        assert_eq!(rates.mismatched, 1);
    }
}
