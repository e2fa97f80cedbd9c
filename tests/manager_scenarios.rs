//! Fleet-level behavior: removal policy, leadership, concurrency ceiling,
//! readiness

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use clustersynchro::cluster::ScriptedConnector;
use clustersynchro::config::{RemovalPolicy, SynchroConfig};
use clustersynchro::manager::{AlwaysLeader, DefinitionEvent, LeaderElector, LeaderFlag};
use clustersynchro::storage::{MemoryBackend, ResourceStorage, UpsertOutcome};
use clustersynchro::{SynchroManager, SynchroPhase};

use common::*;

fn manager_with(
    connector: Arc<ScriptedConnector>,
    storage: Arc<dyn ResourceStorage>,
    config: SynchroConfig,
    leader: Arc<dyn LeaderElector>,
) -> Arc<SynchroManager> {
    Arc::new(SynchroManager::new(storage, connector, config, leader))
}

async fn wait_listed(manager: &SynchroManager, name: &str) {
    eventually("cluster listed", || async {
        manager
            .status(name)
            .map(|s| {
                s.phase == SynchroPhase::Running && s.resources.values().all(|r| r.cursor.listed)
            })
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_purge_on_removal() {
    let connector = Arc::new(ScriptedConnector::new());
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let pods = pods();
    for name in ["cluster-b", "cluster-c"] {
        let cluster = connector.add(name);
        for i in 0..4 {
            cluster
                .apply(&pods.gvr, object(&pods, &format!("p{}", i), i))
                .unwrap();
        }
    }

    let config = SynchroConfig {
        removal_policy: RemovalPolicy::Purge,
        ..fast_config()
    };
    let manager = manager_with(
        connector,
        storage.clone(),
        config,
        Arc::new(AlwaysLeader::new()),
    );
    for name in ["cluster-b", "cluster-c"] {
        manager
            .apply(DefinitionEvent::Added(definition(name, vec![pods.clone()])))
            .await;
    }
    wait_listed(&manager, "cluster-b").await;
    wait_listed(&manager, "cluster-c").await;
    assert_eq!(storage.count("cluster-b", &pods.gvr).await.unwrap(), 4);

    let synchro = manager.synchro("cluster-b").unwrap();
    manager
        .apply(DefinitionEvent::Removed("cluster-b".to_string()))
        .await;

    assert_eq!(synchro.phase(), SynchroPhase::Stopped);
    assert_eq!(storage.count("cluster-b", &pods.gvr).await.unwrap(), 0);
    let stats = storage.stats().await.unwrap();
    assert_eq!(stats.cluster_counts.get("cluster-b").copied().unwrap_or(0), 0);
    assert_eq!(storage.count("cluster-c", &pods.gvr).await.unwrap(), 4);
    assert!(manager.status("cluster-b").is_none());
    assert!(!manager.readiness().is_tracked("cluster-b"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retain_on_removal() {
    let connector = Arc::new(ScriptedConnector::new());
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let pods = pods();
    let cluster = connector.add("a");
    cluster.apply(&pods.gvr, object(&pods, "p", 1)).unwrap();

    let manager = manager_with(
        connector,
        storage.clone(),
        fast_config(),
        Arc::new(AlwaysLeader::new()),
    );
    manager
        .apply(DefinitionEvent::Added(definition("a", vec![pods.clone()])))
        .await;
    wait_listed(&manager, "a").await;
    manager.apply(DefinitionEvent::Removed("a".to_string())).await;

    assert_eq!(storage.count("a", &pods.gvr).await.unwrap(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_leadership_loss_stops_and_regain_restarts() {
    let connector = Arc::new(ScriptedConnector::new());
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let pods = pods();
    let a = connector.add("a");
    connector.add("b");
    a.apply(&pods.gvr, object(&pods, "p", 1)).unwrap();

    let leader = Arc::new(LeaderFlag::new(true));
    let config = SynchroConfig {
        removal_policy: RemovalPolicy::Purge,
        ..fast_config()
    };
    let manager = manager_with(connector, storage.clone(), config, leader.clone());
    let (tx, rx) = mpsc::channel(16);
    let control = manager.spawn(rx);

    tx.send(DefinitionEvent::Added(definition("a", vec![pods.clone()])))
        .await
        .unwrap();
    wait_listed(&manager, "a").await;
    let first_run = manager.status("a").unwrap().run_id;

    leader.set(false);
    eventually("synchros stopped", || async {
        manager.status("a").map(|s| s.phase) == Some(SynchroPhase::Stopped)
    })
    .await;
    assert_eq!(a.open_watches(), 0);
    // Stopping on leadership loss never purges
    assert_eq!(storage.count("a", &pods.gvr).await.unwrap(), 1);

    // Followers only record definitions
    tx.send(DefinitionEvent::Added(definition("b", vec![pods.clone()])))
        .await
        .unwrap();
    eventually("definition recorded", || async {
        manager.definition("b").is_some()
    })
    .await;
    assert!(manager.status("b").is_none());

    leader.set(true);
    wait_listed(&manager, "a").await;
    wait_listed(&manager, "b").await;
    assert_ne!(manager.status("a").unwrap().run_id, first_run);

    manager.shutdown().await;
    control.await.unwrap();
}

#[tokio::test]
async fn test_concurrency_ceiling_queues_synchros() {
    let connector = Arc::new(ScriptedConnector::new());
    connector.add("a");
    connector.add("b");
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let config = SynchroConfig {
        max_concurrent_synchros: 1,
        ..fast_config()
    };
    let manager = manager_with(connector, storage, config, Arc::new(AlwaysLeader::new()));

    manager
        .apply(DefinitionEvent::Added(definition("a", vec![pods()])))
        .await;
    manager
        .apply(DefinitionEvent::Added(definition("b", vec![pods()])))
        .await;
    wait_listed(&manager, "a").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.status("b").unwrap().phase, SynchroPhase::Pending);
    assert_eq!(manager.running(), 1);

    manager.apply(DefinitionEvent::Removed("a".to_string())).await;
    wait_listed(&manager, "b").await;
    assert_eq!(manager.running(), 1);

    manager.shutdown().await;
    assert_eq!(manager.running(), 0);
}

#[tokio::test]
async fn test_readiness_follows_errors_past_grace() {
    let connector = Arc::new(ScriptedConnector::new());
    let cluster = connector.add("strict");
    let lenient = connector.add("lenient");
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let pods = pods();
    cluster.apply(&pods.gvr, object(&pods, "p", 1)).unwrap();
    lenient.apply(&pods.gvr, object(&pods, "p", 1)).unwrap();

    let manager = manager_with(
        connector,
        storage.clone(),
        fast_config(),
        Arc::new(AlwaysLeader::new()),
    );
    let mut strict = definition("strict", vec![pods.clone()]);
    strict.readiness.grace_period_secs = Some(0);
    manager.apply(DefinitionEvent::Added(strict)).await;
    manager
        .apply(DefinitionEvent::Added(definition("lenient", vec![pods.clone()])))
        .await;

    let readiness = manager.readiness();
    assert!(!readiness.is_ready("unknown"));
    eventually("both ready", || async {
        readiness.is_ready("strict") && readiness.is_ready("lenient")
    })
    .await;

    cluster.set_available(false);
    lenient.set_available(false);
    eventually("strict cluster unready", || async {
        !readiness.is_ready("strict")
    })
    .await;
    let verdict = readiness.readiness("strict");
    assert!(verdict.reasons.iter().any(|r| r.contains("v1/pods")));
    // Within the default grace period
    eventually("lenient cluster saw the outage", || async {
        readiness
            .snapshot("lenient")
            .map(|s| s.last_error.is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(readiness.is_ready("lenient"));
    assert_eq!(readiness.stale_clusters(), vec!["strict".to_string()]);

    cluster.set_available(true);
    lenient.set_available(true);
    eventually("strict cluster recovers", || async {
        readiness.is_ready("strict")
    })
    .await;

    let health = readiness.overall_health(storage.as_ref()).await;
    assert!(health.storage.healthy);
    assert_eq!(health.clusters.len(), 2);

    manager.shutdown().await;
    assert!(!readiness.is_ready("strict"));
}

#[tokio::test]
async fn test_purge_waits_for_writes_still_running_after_drain_timeout() {
    let connector = Arc::new(ScriptedConnector::new());
    let storage = Arc::new(InstrumentedStorage::default());
    let pods = pods();
    let cluster = connector.add("a");
    cluster.apply(&pods.gvr, object(&pods, "p1", 1)).unwrap();

    let config = SynchroConfig {
        removal_policy: RemovalPolicy::Purge,
        drain_timeout_ms: 50,
        ..fast_config()
    };
    let manager = manager_with(
        connector,
        storage.clone(),
        config,
        Arc::new(AlwaysLeader::new()),
    );
    manager
        .apply(DefinitionEvent::Added(definition("a", vec![pods.clone()])))
        .await;
    wait_listed(&manager, "a").await;

    // Outlives the drain timeout
    storage.slow_upserts(Duration::from_millis(300));
    cluster.apply(&pods.gvr, object(&pods, "p2", 2)).unwrap();
    eventually("upsert in flight", || async { storage.upserts_in_flight() == 1 }).await;

    manager.apply(DefinitionEvent::Removed("a".to_string())).await;
    assert_eq!(storage.upserts_in_flight(), 0);
    assert_eq!(storage.count("a", &pods.gvr).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(storage.count("a", &pods.gvr).await.unwrap(), 0);
    manager.shutdown().await;
}

fn failing_purge_setup() -> (Arc<ScriptedConnector>, Arc<InstrumentedStorage>, SynchroConfig) {
    let connector = Arc::new(ScriptedConnector::new());
    connector.add("a");
    let storage = Arc::new(InstrumentedStorage::default());
    storage.fail_purges(true);
    let config = SynchroConfig {
        removal_policy: RemovalPolicy::Purge,
        // Retries would otherwise go on for a long time
        degraded_after: 10_000,
        ..fast_config()
    };
    (connector, storage, config)
}

#[tokio::test]
async fn test_losing_leadership_ends_purge_retries() {
    let (connector, storage, config) = failing_purge_setup();
    let leader = Arc::new(LeaderFlag::new(true));
    let manager = manager_with(connector, storage.clone(), config, leader.clone());
    let (tx, rx) = mpsc::channel(16);
    let control = manager.spawn(rx);

    tx.send(DefinitionEvent::Added(definition("a", vec![pods()])))
        .await
        .unwrap();
    wait_listed(&manager, "a").await;
    tx.send(DefinitionEvent::Removed("a".to_string()))
        .await
        .unwrap();
    eventually("purge retried", || async { storage.purges() >= 2 }).await;

    leader.set(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let attempts = storage.purges();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.purges(), attempts);

    // The control loop is free again
    tx.send(DefinitionEvent::Added(definition("b", vec![pods()])))
        .await
        .unwrap();
    eventually("definition recorded", || async {
        manager.definition("b").is_some()
    })
    .await;

    manager.shutdown().await;
    control.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_interrupts_purge_retries() {
    let (connector, storage, config) = failing_purge_setup();
    let manager = manager_with(
        connector,
        storage.clone(),
        config,
        Arc::new(AlwaysLeader::new()),
    );
    let (tx, rx) = mpsc::channel(16);
    let control = manager.spawn(rx);

    tx.send(DefinitionEvent::Added(definition("a", vec![pods()])))
        .await
        .unwrap();
    wait_listed(&manager, "a").await;
    tx.send(DefinitionEvent::Removed("a".to_string()))
        .await
        .unwrap();
    eventually("purge retried", || async { storage.purges() >= 2 }).await;

    tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
        .await
        .expect("shutdown blocked by purge retries");
    tokio::time::timeout(Duration::from_secs(1), control)
        .await
        .expect("control loop still running")
        .unwrap();
}

#[tokio::test]
async fn test_compaction_drops_only_expired_tombstones() {
    let connector = Arc::new(ScriptedConnector::new());
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let config = SynchroConfig {
        request_timeout_ms: 300,
        watch_idle_timeout_ms: 300,
        tombstone_retention_ms: 300,
        tombstone_compaction_interval_ms: 50,
        ..fast_config()
    };
    config.validate().unwrap();
    let manager = manager_with(
        connector,
        storage.clone(),
        config,
        Arc::new(AlwaysLeader::new()),
    );
    let (_tx, rx) = mpsc::channel(16);
    let control = manager.spawn(rx);

    let live = record("a", "obj", "5");
    let identity = live.identity();
    storage.upsert(live).await.unwrap();
    storage.delete(&identity, Some("6")).await.unwrap();

    // Within retention the tombstone still rejects an older replay
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(
        storage.upsert(record("a", "obj", "5")).await.unwrap(),
        UpsertOutcome::Unchanged
    );
    assert_eq!(storage.stats().await.unwrap().tombstone_count, 1);

    eventually("tombstone compacted", || async {
        storage.stats().await.unwrap().tombstone_count == 0
    })
    .await;
    assert!(storage.get(&identity).await.unwrap().is_none());

    manager.shutdown().await;
    control.await.unwrap();
}

#[tokio::test]
async fn test_followers_do_not_compact() {
    let storage: Arc<dyn ResourceStorage> = Arc::new(MemoryBackend::default());
    let config = SynchroConfig {
        request_timeout_ms: 100,
        watch_idle_timeout_ms: 100,
        tombstone_retention_ms: 100,
        tombstone_compaction_interval_ms: 20,
        ..fast_config()
    };
    let manager = manager_with(
        Arc::new(ScriptedConnector::new()),
        storage.clone(),
        config,
        Arc::new(LeaderFlag::new(false)),
    );
    let (_tx, rx) = mpsc::channel(16);
    let control = manager.spawn(rx);

    let identity = record("a", "obj", "1").identity();
    storage.delete(&identity, Some("2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(storage.stats().await.unwrap().tombstone_count, 1);

    assert_eq!(manager.compact_tombstones().await.unwrap(), 1);
    manager.shutdown().await;
    control.await.unwrap();
}
