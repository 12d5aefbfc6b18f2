//! End-to-end lifecycle: seed a primary, mirror live writes, backfill,
//! compare sampled reads, promote, and decommission.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use umbra_core::{
    BackendRef, ConfigStore, KeyValueBackend, MemoryBackend, MemoryConfigStore, MigrationPhase,
    Namespace, PhaseThresholds,
};
use umbra_migrate::{
    BackendProbe, BackendRegistry, BackfillConfig, BackfillEngine, CreatePlan, DualWriteGate,
    MetricsFeed, MigrationMetrics, MigrationOrchestrator, NoSensitiveFields, OrchestratorConfig,
    PlanCache, PoolConfig, ShadowPool, ShadowReadComparator, ShadowWriteConfig, TickOutcome,
    WindowConfig,
};

const DEADLINE: Duration = Duration::from_secs(1);
const SEEDED_KEYS: usize = 10_000;

struct Harness {
    orch: Arc<MigrationOrchestrator>,
    gate: DualWriteGate,
    comparator: ShadowReadComparator,
    pool: Arc<ShadowPool>,
    metrics: Arc<MigrationMetrics>,
    store: Arc<MemoryConfigStore>,
    legacy: Arc<MemoryBackend>,
    target: Arc<MemoryBackend>,
    ns: Namespace,
}

fn harness() -> Harness {
    let ns = Namespace::new("user-profiles").unwrap();
    let legacy = Arc::new(MemoryBackend::new("legacy"));
    let target = Arc::new(MemoryBackend::new("target"));

    let mut registry = BackendRegistry::new();
    registry.insert("legacy", Arc::clone(&legacy) as Arc<dyn KeyValueBackend>);
    registry.insert("target", Arc::clone(&target) as Arc<dyn KeyValueBackend>);
    let registry = Arc::new(registry);

    let store = Arc::new(MemoryConfigStore::new());
    let plans = Arc::new(PlanCache::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>
    ));
    let metrics = Arc::new(MigrationMetrics::new(WindowConfig::default()));
    let pool = Arc::new(ShadowPool::start(
        &PoolConfig {
            workers: 4,
            queue_capacity: 4_096,
        },
        Arc::clone(&metrics),
    ));

    let retry = ShadowWriteConfig {
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
    };
    let gate = DualWriteGate::new(
        Arc::clone(&plans),
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&metrics),
        retry,
        DEADLINE,
    );
    let comparator = ShadowReadComparator::new(
        Arc::clone(&plans),
        Arc::clone(&registry),
        Arc::clone(&pool),
        Arc::clone(&metrics),
        Arc::new(NoSensitiveFields),
        DEADLINE,
    );
    let probe = Arc::new(BackendProbe::new(Arc::clone(&registry), DEADLINE));
    let backfill = Arc::new(BackfillEngine::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&registry),
        Arc::clone(&metrics),
        BackfillConfig {
            batch_size: 500,
            max_items_per_sec: 0,
            stall_after_failures: 5,
        },
        DEADLINE,
    ));

    let orch = Arc::new(MigrationOrchestrator::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        plans,
        registry,
        Arc::clone(&metrics) as Arc<dyn MetricsFeed>,
        Arc::clone(&metrics),
        probe,
        backfill,
        OrchestratorConfig::default(),
    ));

    Harness {
        orch,
        gate,
        comparator,
        pool,
        metrics,
        store,
        legacy,
        target,
        ns,
    }
}

fn profile(id: usize) -> Bytes {
    Bytes::from(format!(r#"{{"id":{id},"balance":{}}}"#, id * 10))
}

async fn seed_legacy(h: &Harness) {
    for i in 0..SEEDED_KEYS {
        h.legacy
            .put(&h.ns, &format!("user-{i:05}"), profile(i), DEADLINE)
            .await
            .unwrap();
    }
}

async fn wait_for_backfill(h: &Harness) {
    for _ in 0..500 {
        if let Some(cursor) = h.store.load_cursor(&h.ns).await.unwrap() {
            if cursor.completed {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backfill did not complete in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn full_migration_lifecycle() {
    let h = harness();
    seed_legacy(&h).await;

    // Plan and start mirroring.
    h.orch
        .create_plan(CreatePlan {
            namespace: h.ns.clone(),
            primary: BackendRef::new("legacy"),
            shadow: BackendRef::new("target"),
            sample_rate: 1.0,
            thresholds: PhaseThresholds::default(),
            expected_items: Some(SEEDED_KEYS as u64),
        })
        .await
        .unwrap();
    h.orch.start_migration(&h.ns).await.unwrap();

    // Live traffic while mirroring: callers see only the primary write.
    for i in 0..50 {
        h.gate
            .put(&h.ns, &format!("live-{i:03}"), profile(100_000 + i))
            .await
            .unwrap();
    }
    h.pool.quiesce().await;
    assert_eq!(h.target.key_count(&h.ns).unwrap(), 50);
    assert_eq!(h.legacy.key_count(&h.ns).unwrap(), SEEDED_KEYS + 50);

    // Bulk copy, with more live writes racing it.
    h.orch.begin_backfill(&h.ns).await.unwrap();
    for i in 50..100 {
        h.gate
            .put(&h.ns, &format!("live-{i:03}"), profile(100_000 + i))
            .await
            .unwrap();
    }
    wait_for_backfill(&h).await;
    h.pool.quiesce().await;
    h.orch.shutdown().await;

    // Every seeded key was copied and every live key was mirrored.
    assert_eq!(h.target.key_count(&h.ns).unwrap(), SEEDED_KEYS + 100);
    assert_eq!(h.target.dump(&h.ns).unwrap(), h.legacy.dump(&h.ns).unwrap());

    // The completed cursor plus healthy writes advance to shadow reads.
    let outcome = h.orch.tick(&h.ns, Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::AutoAdvanced {
            to: MigrationPhase::ShadowRead
        }
    );

    // Corrupt five shadow values behind the comparator's back.
    for i in 0..5 {
        h.target
            .put(
                &h.ns,
                &format!("user-{i:05}"),
                Bytes::from_static(b"{\"id\":-1}"),
                DEADLINE,
            )
            .await
            .unwrap();
    }

    // Sampled reads flag exactly those five and never leak shadow data.
    for i in 0..1_000 {
        let key = format!("user-{i:05}");
        let value = h.comparator.get(&h.ns, &key).await.unwrap();
        assert_eq!(value, Some(profile(i)), "response must come from the primary");
    }
    h.pool.quiesce().await;

    let plan = h.store.load_plan(&h.ns).await.unwrap().unwrap();
    let reads = h
        .metrics
        .comparison_rates(&h.ns, plan.thresholds.mismatch_window(), Utc::now());
    assert_eq!(reads.mismatched, 5);
    assert_eq!(reads.matched, 995);

    // 0.5% mismatch: too dirty to auto-promote, too clean to trip.
    let outcome = h.orch.tick(&h.ns, Utc::now()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Idle);
    let plan = h.store.load_plan(&h.ns).await.unwrap().unwrap();
    assert_eq!(plan.phase, MigrationPhase::ShadowRead);

    // Repair the shadow, then promote by hand.
    for i in 0..5 {
        h.target
            .put(&h.ns, &format!("user-{i:05}"), profile(i), DEADLINE)
            .await
            .unwrap();
    }
    let plan = h.orch.promote(&h.ns).await.unwrap();
    assert_eq!(plan.phase, MigrationPhase::Promoted);
    assert_eq!(plan.primary, BackendRef::new("target"));
    assert_eq!(plan.shadow, BackendRef::new("legacy"));

    // Post-promotion writes land on the new primary and keep the old one
    // mirrored for the safety period.
    h.gate
        .put(&h.ns, "post-promote", profile(999_999))
        .await
        .unwrap();
    h.pool.quiesce().await;
    assert_eq!(
        h.target.get(&h.ns, "post-promote", DEADLINE).await.unwrap(),
        Some(profile(999_999))
    );
    assert_eq!(
        h.legacy.get(&h.ns, "post-promote", DEADLINE).await.unwrap(),
        Some(profile(999_999))
    );
    assert_eq!(
        h.comparator.get(&h.ns, "post-promote").await.unwrap(),
        Some(profile(999_999))
    );
    h.pool.quiesce().await;

    // After a clean confidence period the old backend can be retired.
    let later = Utc::now() + chrono::Duration::days(8);
    let plan = h.orch.decommission(&h.ns, later).await.unwrap();
    assert_eq!(plan.phase, MigrationPhase::Decommissioned);

    let status = h.orch.status(&h.ns, Utc::now()).await.unwrap();
    assert_eq!(status.phase, MigrationPhase::Decommissioned);
    assert_eq!(status.backfill_progress, Some(100.0));

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_during_shadow_read_keeps_serving_the_original_primary() {
    let h = harness();
    for i in 0..100 {
        h.legacy
            .put(&h.ns, &format!("user-{i:05}"), profile(i), DEADLINE)
            .await
            .unwrap();
    }

    h.orch
        .create_plan(CreatePlan {
            namespace: h.ns.clone(),
            primary: BackendRef::new("legacy"),
            shadow: BackendRef::new("target"),
            sample_rate: 1.0,
            thresholds: PhaseThresholds::default(),
            expected_items: Some(100),
        })
        .await
        .unwrap();
    h.orch.start_migration(&h.ns).await.unwrap();
    h.orch.begin_backfill(&h.ns).await.unwrap();
    wait_for_backfill(&h).await;
    h.orch.shutdown().await;

    // Healthy mirroring evidence so the tick advances to shadow reads.
    h.gate.put(&h.ns, "user-00000", profile(0)).await.unwrap();
    h.pool.quiesce().await;
    let outcome = h.orch.tick(&h.ns, Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::AutoAdvanced {
            to: MigrationPhase::ShadowRead
        }
    );

    let plan = h.orch.rollback(&h.ns, "cold feet").await.unwrap();
    assert_eq!(plan.phase, MigrationPhase::RolledBack);
    assert_eq!(plan.primary, BackendRef::new("legacy"));

    // Reads still come from the original primary and nothing is sampled
    // or mirrored anymore.
    let before = h.target.key_count(&h.ns).unwrap();
    assert_eq!(
        h.comparator.get(&h.ns, "user-00042").await.unwrap(),
        Some(profile(42))
    );
    h.gate
        .put(&h.ns, "rolled-back-write", profile(7))
        .await
        .unwrap();
    h.pool.quiesce().await;
    assert_eq!(h.target.key_count(&h.ns).unwrap(), before);
    assert_eq!(
        h.legacy
            .get(&h.ns, "rolled-back-write", DEADLINE)
            .await
            .unwrap(),
        Some(profile(7))
    );

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_are_mirrored_through_every_mirroring_phase() {
    let h = harness();
    h.legacy
        .put(&h.ns, "doomed", profile(1), DEADLINE)
        .await
        .unwrap();
    h.target
        .put(&h.ns, "doomed", profile(1), DEADLINE)
        .await
        .unwrap();

    h.orch
        .create_plan(CreatePlan {
            namespace: h.ns.clone(),
            primary: BackendRef::new("legacy"),
            shadow: BackendRef::new("target"),
            sample_rate: 0.0,
            thresholds: PhaseThresholds::default(),
            expected_items: None,
        })
        .await
        .unwrap();
    h.orch.start_migration(&h.ns).await.unwrap();

    h.gate.delete(&h.ns, "doomed").await.unwrap();
    h.pool.quiesce().await;

    assert_eq!(h.legacy.get(&h.ns, "doomed", DEADLINE).await.unwrap(), None);
    assert_eq!(h.target.get(&h.ns, "doomed", DEADLINE).await.unwrap(), None);

    h.pool.shutdown().await;
}
