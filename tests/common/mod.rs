//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use clustersynchro::cluster::ScriptedCluster;
use clustersynchro::config::{BackoffConfig, SynchroConfig};
use clustersynchro::storage::{
    DeleteOutcome, HealthStatus, ListOptions, ListPage, MemoryBackend, ResourceStorage,
    StorageStats, UpsertOutcome, VersionOrder, WatchStream, MAX_PAGE_SIZE,
};
use clustersynchro::{
    ClusterConnection, ClusterDefinition, ClusterSynchro, GroupVersionKind, GroupVersionResource,
    ResourceIdentity, ResourceRecord, ResourceType, Result, SynchroError, SynchroStatus,
};

pub fn pods() -> ResourceType {
    ResourceType::new(GroupVersionResource::new("", "v1", "pods"), "Pod")
}

pub fn configmaps() -> ResourceType {
    ResourceType::new(GroupVersionResource::new("", "v1", "configmaps"), "ConfigMap")
}

/// Short backoff and timeouts so failure paths finish quickly
pub fn fast_config() -> SynchroConfig {
    SynchroConfig {
        backoff: BackoffConfig {
            initial_ms: 10,
            multiplier: 2.0,
            max_ms: 100,
            jitter: 0.1,
        },
        request_timeout_ms: 2_000,
        drain_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn definition(name: &str, resources: Vec<ResourceType>) -> ClusterDefinition {
    ClusterDefinition::new(name, ClusterConnection::new("scripted://"), resources)
}

/// Native object with a `data` payload
pub fn object(resource: &ResourceType, name: &str, data: u64) -> Value {
    let mut object = ScriptedCluster::object(resource, Some("default"), name);
    object["data"] = json!({ "value": data });
    object
}

pub fn record(cluster: &str, name: &str, rv: &str) -> ResourceRecord {
    ResourceRecord {
        cluster: cluster.to_string(),
        gvk: GroupVersionKind::new("", "v1", "Pod"),
        resource: "pods".to_string(),
        namespace: Some("default".to_string()),
        name: name.to_string(),
        uid: None,
        resource_version: rv.to_string(),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        created_at: None,
        last_seen: Utc::now(),
        payload: json!({ "rv": rv }),
        deleted: false,
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a synchro status matching `what`
pub async fn wait_for_status(
    synchro: &ClusterSynchro,
    what: impl Fn(&SynchroStatus) -> bool,
) -> SynchroStatus {
    let mut rx = synchro.subscribe();
    let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| what(s)))
        .await
        .expect("status condition not reached")
        .expect("status channel closed")
        .clone();
    status
}

pub fn cursor_at(status: &SynchroStatus, resource: &ResourceType, rv: &str) -> bool {
    status
        .cursor(&resource.gvr)
        .map(|c| c.listed && c.resource_version.as_deref() == Some(rv))
        .unwrap_or(false)
}

/// Every live record of one type: name -> (resource version, payload data)
pub async fn stored_state(
    storage: &Arc<dyn ResourceStorage>,
    cluster: &str,
    resource: &ResourceType,
) -> BTreeMap<String, (String, Value)> {
    let mut state = BTreeMap::new();
    let mut options = ListOptions {
        limit: Some(MAX_PAGE_SIZE),
        ..Default::default()
    };
    loop {
        let page = storage
            .list(cluster, &resource.gvr, &options)
            .await
            .expect("list failed");
        for record in page.items {
            let data = record.payload.get("data").cloned().unwrap_or(Value::Null);
            state.insert(record.name, (record.resource_version, data));
        }
        match page.continue_token {
            Some(token) => options.continue_token = Some(token),
            None => return state,
        }
    }
}

/// What a cluster currently serves for one type, in the same shape
pub async fn cluster_state(
    cluster: &ScriptedCluster,
    resource: &ResourceType,
) -> BTreeMap<String, (String, Value)> {
    use clustersynchro::cluster::ClusterClient;

    let list = cluster.list(resource).await.expect("cluster list failed");
    list.items
        .into_iter()
        .map(|item| {
            let metadata = &item["metadata"];
            (
                metadata["name"].as_str().unwrap_or_default().to_string(),
                (
                    metadata["resourceVersion"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    item.get("data").cloned().unwrap_or(Value::Null),
                ),
            )
        })
        .collect()
}

/// Memory backend with switchable slow upserts and failing purges
///
/// A slow upsert runs on its own task, so dropping the caller does not stop
/// it; that matches a blocking write already handed to a thread.
#[derive(Default)]
pub struct InstrumentedStorage {
    inner: Arc<MemoryBackend>,
    upsert_delay_ms: AtomicU64,
    fail_purge: AtomicBool,
    pub upserts_started: AtomicUsize,
    pub upserts_finished: AtomicUsize,
    pub purge_calls: AtomicUsize,
}

impl InstrumentedStorage {
    pub fn slow_upserts(&self, delay: Duration) {
        self.upsert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_purges(&self, fail: bool) {
        self.fail_purge.store(fail, Ordering::SeqCst);
    }

    pub fn upserts_in_flight(&self) -> usize {
        self.upserts_started.load(Ordering::SeqCst) - self.upserts_finished.load(Ordering::SeqCst)
    }

    pub fn purges(&self) -> usize {
        self.purge_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStorage for InstrumentedStorage {
    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    fn version_order(&self) -> VersionOrder {
        self.inner.version_order()
    }

    async fn upsert(&self, record: ResourceRecord) -> Result<UpsertOutcome> {
        let delay = Duration::from_millis(self.upsert_delay_ms.load(Ordering::SeqCst));
        if delay.is_zero() {
            return self.inner.upsert(record).await;
        }

        self.upserts_started.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let outcome = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.upsert(record).await
        })
        .await
        .map_err(|e| SynchroError::Internal(e.to_string()))?;
        self.upserts_finished.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome> {
        self.inner.delete(identity, resource_version).await
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>> {
        self.inner.get(identity).await
    }

    async fn list(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        options: &ListOptions,
    ) -> Result<ListPage> {
        self.inner.list(cluster, gvr, options).await
    }

    async fn watch(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: Option<&str>,
    ) -> Result<WatchStream> {
        self.inner.watch(cluster, gvr, since).await
    }

    async fn purge_resource(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<usize> {
        self.inner.purge_resource(cluster, gvr).await
    }

    async fn purge_cluster(&self, cluster: &str) -> Result<usize> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_purge.load(Ordering::SeqCst) {
            return Err(SynchroError::StorageUnavailable("purge refused".to_string()));
        }
        self.inner.purge_cluster(cluster).await
    }

    async fn compact_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.inner.compact_tombstones(older_than).await
    }

    async fn count(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<u64> {
        self.inner.count(cluster, gvr).await
    }

    async fn stats(&self) -> Result<StorageStats> {
        self.inner.stats().await
    }

    async fn health(&self) -> HealthStatus {
        self.inner.health().await
    }
}
