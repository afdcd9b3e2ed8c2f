//! End-to-end disaster-recovery scenarios: full runs for each recovery mode,
//! plus targeted setups for collision resolution, dry-run idempotence,
//! capacity autoscaling, and post-backup loss classification.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use slog::Logger;
use tokio::sync::Mutex;

use metarepair::check::ConsistencyChecker;
use metarepair::cluster::{BackupAgent, DataCluster, ManagementCluster};
use metarepair::driver::{BackupPhase, MutationDriver};
use metarepair::model::{AccessTime, ReferenceModel};
use metarepair::restore::RestoreOrchestrator;
use metarepair::{Caller, ReconciliationRun, RunConfig, TenantState};

// The full runs push tens of thousands of foreground operations through the
// directory; a discard drain keeps them quiet.
fn quiet_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn scenario_config(seed: u64) -> RunConfig {
    RunConfig::new(seed).with_mutation_window(Duration::from_millis(100))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_management_only_recovery_rebuilds_directory() {
    let config = scenario_config(101).with_recovery(true, false);
    let mut run = ReconciliationRun::with_simulated_clusters(config, 3, quiet_logger());

    run.setup().await.expect("setup should succeed");
    run.execute().await.expect("execute should succeed");

    // Every tracked tenant must reappear in the rebuilt directory, ready and
    // under its tracked name and group.
    let management = run.management();
    let directory: BTreeMap<_, _> = management.scan_tenants().await.into_iter().collect();
    let model = run.model();
    let model = model.lock().await;
    assert_eq!(directory.len(), model.tenant_count());
    for (id, tracked) in model.tenants() {
        let entry = directory.get(&id).expect("tracked tenant missing from directory");
        assert_eq!(entry.state, TenantState::Ready);
        assert_eq!(entry.name, tracked.name);
        assert_eq!(entry.tenant_group, tracked.tenant_group);
    }
    drop(model);

    run.verify().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_only_recovery_preserves_pre_backup_tenants() {
    let config = scenario_config(202).with_recovery(false, true);
    let mut run = ReconciliationRun::with_simulated_clusters(config, 3, quiet_logger());

    run.setup().await.expect("setup should succeed");
    run.execute().await.expect("execute should succeed");

    // Every pre-backup tenant must still be resident on its restored cluster.
    let model = run.model();
    let model = model.lock().await;
    for (name, record) in model.clusters() {
        if !record.restored {
            continue;
        }
        let data = run.data_cluster(name).expect("cluster handle");
        let local: BTreeMap<_, _> = data.scan_tenants().await.into_iter().collect();
        for id in &record.tenants {
            let tracked = model.tenant(*id).expect("tracked tenant");
            if tracked.create_time == AccessTime::BeforeBackup {
                assert!(
                    local.contains_key(id),
                    "pre-backup tenant {} missing from restored cluster {}",
                    id,
                    name
                );
            }
        }
    }
    drop(model);

    run.verify().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_recovery_across_seeds() {
    for seed in [1u64, 2, 3] {
        let config = scenario_config(seed).with_recovery(true, true);
        let run = ReconciliationRun::with_simulated_clusters(config, 3, quiet_logger());
        run.run().await.unwrap_or_else(|e| panic!("run with seed {} failed: {}", seed, e));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_random_mode_recovery() {
    let mut rng = StdRng::seed_from_u64(99);
    for seed in [11u64, 12, 13] {
        let config = scenario_config(seed).random_mode(&mut rng);
        let run = ReconciliationRun::with_simulated_clusters(config, 2, quiet_logger());
        run.run().await.unwrap_or_else(|e| panic!("run with seed {} failed: {}", seed, e));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conflict_injection_is_invisible_to_the_run() {
    let config = scenario_config(303)
        .with_recovery(true, true)
        .with_conflict_probability(0.05);
    let run = ReconciliationRun::with_simulated_clusters(config, 2, quiet_logger());
    run.run().await.expect("transient conflicts must be retried away");
}

/// Two clusters independently hold a tenant named `tenantX` with different
/// ids when the directory is wiped; exactly the tracked id survives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tenant_name_collision_resolution() {
    let logger = quiet_logger();
    let management = Arc::new(ManagementCluster::new(logger.clone()));
    let cluster_a = Arc::new(DataCluster::new("cluster_00000000", logger.clone()));
    let cluster_b = Arc::new(DataCluster::new("cluster_00000001", logger.clone()));

    management.create_metacluster("management_cluster", 7).await.unwrap();
    // Skewed capacities pin the tracked copy onto cluster_a.
    management.register_cluster("cluster_00000000", cluster_a.clone(), 4).await.unwrap();
    management.register_cluster("cluster_00000001", cluster_b.clone(), 1).await.unwrap();

    let tracked = management.create_tenant("tenantX", None).await.unwrap();
    assert_eq!(tracked.assigned_cluster.as_deref(), Some("cluster_00000000"));

    let model = Arc::new(Mutex::new(ReferenceModel::new([
        "cluster_00000000",
        "cluster_00000001",
    ])));
    model.lock().await.record_create(
        tracked.id,
        "tenantX",
        "cluster_00000000",
        None,
        AccessTime::BeforeBackup,
    );

    // A divergent history left an untracked tenant of the same name (and a
    // different id) on cluster_b.
    let stale_id = tracked.id + 999;
    cluster_b
        .create_local(metarepair::TenantMapEntry::new(stale_id, "tenantX", None))
        .await;

    // Wipe the directory and rebuild it from the data clusters.
    management.reset().await;
    let orchestrator = RestoreOrchestrator::new(
        management.clone(),
        BTreeMap::from([
            ("cluster_00000000".to_string(), cluster_a.clone()),
            ("cluster_00000001".to_string(), cluster_b.clone()),
        ]),
        Arc::new(BackupAgent::new(logger.clone())),
        model.clone(),
        StdRng::seed_from_u64(42),
        logger.clone(),
    );
    orchestrator
        .restore_management_cluster()
        .await
        .expect("rebuild should converge after collision resolution");

    // Exactly one tenantX remains, under the tracked id.
    let names = management.scan_name_index().await;
    let matches: Vec<_> = names.iter().filter(|(name, _)| name == "tenantX").collect();
    assert_eq!(matches.len(), 1, "duplicate name survived the rebuild");
    assert_eq!(matches[0].1, tracked.id);

    // The stale copy is gone from its cluster and from tracking.
    let local_b: BTreeMap<_, _> = cluster_b.scan_tenants().await.into_iter().collect();
    assert!(!local_b.contains_key(&stale_id));
    let model_guard = model.lock().await;
    assert!(model_guard.contains_tenant(tracked.id));
    assert!(!model_guard.contains_tenant(stale_id));
    assert!(model_guard.is_tombstoned(stale_id));
    drop(model_guard);

    let checker = ConsistencyChecker::new(
        management,
        BTreeMap::from([
            ("cluster_00000000".to_string(), cluster_a),
            ("cluster_00000001".to_string(), cluster_b),
        ]),
        true,
        false,
        logger,
    );
    checker.check(&*model.lock().await, &[]).await;
}

/// Capacity exhaustion while creating tenants autoscales every cluster by
/// the growth factor and the creates eventually succeed, invisibly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_exhaustion_autoscales() {
    let logger = quiet_logger();
    let management = Arc::new(ManagementCluster::new(logger.clone()));
    let cluster = Arc::new(DataCluster::new("cluster_00000000", logger.clone()));
    management.create_metacluster("management_cluster", 3).await.unwrap();
    management.register_cluster("cluster_00000000", cluster, 1).await.unwrap();

    let model = Arc::new(Mutex::new(ReferenceModel::new(["cluster_00000000"])));
    let mut driver = MutationDriver::new(
        management.clone(),
        model.clone(),
        vec!["cluster_00000000".to_string()],
        Arc::new(BackupPhase::new()),
        StdRng::seed_from_u64(9),
        1000,
        20,
        1,
        logger,
    );

    driver.create_initial_tenants(10).await.expect("creates must not surface capacity errors");

    assert_eq!(model.lock().await.tenant_count(), 10);
    let capacity = management.cluster_capacity("cluster_00000000").await.unwrap();
    assert!(capacity > 1, "capacity should have grown past its floor, got {}", capacity);
}

/// Dry runs of both restore modes never mutate committed state, however
/// often they run.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restore_dry_run_is_idempotent() {
    let logger = quiet_logger();
    let management = Arc::new(ManagementCluster::new(logger.clone()));
    let cluster = Arc::new(DataCluster::new("cluster_00000000", logger.clone()));
    management.create_metacluster("management_cluster", 5).await.unwrap();
    management.register_cluster("cluster_00000000", cluster.clone(), 8).await.unwrap();
    management.create_tenant("tenant00000001", Some("tenantgroup00000001")).await.unwrap();
    management.create_tenant("tenant00000002", None).await.unwrap();

    let directory_before = management.scan_tenants().await;
    let local_before = cluster.snapshot_tenant_map().await.unwrap();

    // Directory-authoritative dry runs against the registered cluster.
    for _ in 0..3 {
        let mut messages = Vec::new();
        management
            .restore_cluster("cluster_00000000", &cluster, true, true, false, &mut messages)
            .await
            .expect("dry run should succeed");
        assert!(messages.is_empty(), "clean cluster produced advisory messages");
    }
    assert_eq!(management.scan_tenants().await, directory_before);
    assert_eq!(cluster.snapshot_tenant_map().await.unwrap(), local_before);

    // Data-authoritative dry runs against a wiped directory.
    management.reset().await;
    management.create_metacluster("management_cluster", 6).await.unwrap();
    cluster.forget_metacluster().await;
    for _ in 0..3 {
        let mut messages = Vec::new();
        management
            .restore_cluster("cluster_00000000", &cluster, false, true, false, &mut messages)
            .await
            .expect("dry run should succeed");
    }
    assert!(management.scan_tenants().await.is_empty());
    assert_eq!(cluster.snapshot_tenant_map().await.unwrap(), local_before);
}

/// A tenant created after the backup cut is lost by the restore: absent from
/// the data cluster and flagged as an error in the directory, with the
/// cluster's lossy-recovery signal set.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_backup_creation_classified_as_lost() {
    let logger = quiet_logger();
    let management = Arc::new(ManagementCluster::new(logger.clone()));
    let cluster = Arc::new(DataCluster::new("cluster_00000000", logger.clone()));
    management.create_metacluster("management_cluster", 2).await.unwrap();
    management.register_cluster("cluster_00000000", cluster.clone(), 8).await.unwrap();

    let model = Arc::new(Mutex::new(ReferenceModel::new(["cluster_00000000"])));
    let backup = Arc::new(BackupAgent::new(logger.clone()));
    let orchestrator = RestoreOrchestrator::new(
        management.clone(),
        BTreeMap::from([("cluster_00000000".to_string(), cluster.clone())]),
        backup.clone(),
        model.clone(),
        StdRng::seed_from_u64(11),
        logger.clone(),
    );

    let kept = management.create_tenant("tenant00000001", None).await.unwrap();
    model.lock().await.record_create(
        kept.id,
        "tenant00000001",
        "cluster_00000000",
        None,
        AccessTime::BeforeBackup,
    );

    let location = orchestrator.backup_cluster("cluster_00000000").await.unwrap();

    let lost = management.create_tenant("tenant00000002", None).await.unwrap();
    model.lock().await.record_create(
        lost.id,
        "tenant00000002",
        "cluster_00000000",
        None,
        AccessTime::AfterBackup,
    );

    let before_restore = management.scan_tenants().await;
    orchestrator
        .restore_data_cluster("cluster_00000000", &location, true, false)
        .await
        .expect("restore should succeed");

    let directory: BTreeMap<_, _> = management.scan_tenants().await.into_iter().collect();
    assert_eq!(directory[&kept.id].state, TenantState::Ready);
    assert_eq!(directory[&lost.id].state, TenantState::Error);

    let local: BTreeMap<_, _> = cluster.scan_tenants().await.into_iter().collect();
    assert!(local.contains_key(&kept.id));
    assert!(!local.contains_key(&lost.id));

    {
        let model = model.lock().await;
        let record = model.cluster("cluster_00000000");
        assert!(record.restored);
        assert!(record.restore_has_messages);
    }

    let checker = ConsistencyChecker::new(
        management,
        BTreeMap::from([("cluster_00000000".to_string(), cluster)]),
        false,
        true,
        logger,
    );
    checker.check(&*model.lock().await, &before_restore).await;
}

/// A tenant deleted after the backup cut reappears when both the directory
/// and its cluster are recovered; the tombstone set explains it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undeleted_tenant_explained_by_tombstones() {
    let logger = quiet_logger();
    let management = Arc::new(ManagementCluster::new(logger.clone()));
    let cluster = Arc::new(DataCluster::new("cluster_00000000", logger.clone()));
    management.create_metacluster("management_cluster", 2).await.unwrap();
    management.register_cluster("cluster_00000000", cluster.clone(), 8).await.unwrap();

    let model = Arc::new(Mutex::new(ReferenceModel::new(["cluster_00000000"])));
    let backup = Arc::new(BackupAgent::new(logger.clone()));
    let orchestrator = RestoreOrchestrator::new(
        management.clone(),
        BTreeMap::from([("cluster_00000000".to_string(), cluster.clone())]),
        backup,
        model.clone(),
        StdRng::seed_from_u64(23),
        logger.clone(),
    );

    let victim = management.create_tenant("tenant00000001", None).await.unwrap();
    model.lock().await.record_create(
        victim.id,
        "tenant00000001",
        "cluster_00000000",
        None,
        AccessTime::BeforeBackup,
    );

    let location = orchestrator.backup_cluster("cluster_00000000").await.unwrap();

    // Deleted after the cut: the backup still contains it.
    management.delete_tenant(&Caller::trusted(), "tenant00000001").await.unwrap();
    model.lock().await.record_delete(victim.id);

    // Lose both sides: replay the cluster without reattaching, then rebuild
    // the directory from it.
    orchestrator
        .restore_data_cluster("cluster_00000000", &location, false, false)
        .await
        .expect("restore should succeed");
    management.reset().await;
    orchestrator
        .restore_management_cluster()
        .await
        .expect("rebuild should succeed");

    // The deleted tenant is back on both sides, untracked but tombstoned.
    let directory: BTreeMap<_, _> = management.scan_tenants().await.into_iter().collect();
    assert!(directory.contains_key(&victim.id));
    {
        let model = model.lock().await;
        assert!(!model.contains_tenant(victim.id));
        assert!(model.is_tombstoned(victim.id));
    }

    let checker = ConsistencyChecker::new(
        management,
        BTreeMap::from([("cluster_00000000".to_string(), cluster)]),
        true,
        true,
        logger,
    );
    checker.check(&*model.lock().await, &[]).await;
}
