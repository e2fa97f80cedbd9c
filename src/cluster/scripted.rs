//! In-process cluster with a scriptable event log
//!
//! `ScriptedCluster` keeps objects per resource type, assigns increasing
//! resource versions and feeds open watches, much like an API server backed
//! by a single etcd revision counter. Tests drive it to simulate outages,
//! compaction and dropped connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ClusterClient, ClusterConnector, ClusterEventStream, ListResult, WatchEvent};
use crate::error::{Result, SynchroError};
use crate::types::{ClusterDefinition, GroupVersionResource, ResourceType};

type ObjectKey = (String, String);
type WatchSender = mpsc::UnboundedSender<Result<WatchEvent>>;

struct LoggedEvent {
    revision: u64,
    gvr: GroupVersionResource,
    event: WatchEvent,
}

#[derive(Default)]
struct ScriptState {
    revision: u64,
    objects: HashMap<GroupVersionResource, BTreeMap<ObjectKey, Value>>,
    log: Vec<LoggedEvent>,
    /// Watches from at or below this revision are too old
    compacted_through: u64,
    available: bool,
    watchers: Vec<(GroupVersionResource, WatchSender)>,
}

impl ScriptState {
    fn publish(&mut self, gvr: &GroupVersionResource, event: WatchEvent) {
        self.watchers.retain(|(scope, tx)| {
            if scope != gvr {
                return !tx.is_closed();
            }
            tx.send(Ok(event.clone())).is_ok()
        });
        self.log.push(LoggedEvent {
            revision: self.revision,
            gvr: gvr.clone(),
            event,
        });
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(SynchroError::ConnectionFailure(
                "cluster is unreachable".to_string(),
            ))
        }
    }
}

/// A fake member cluster
pub struct ScriptedCluster {
    state: Mutex<ScriptState>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl Default for ScriptedCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key(object: &Value) -> Result<ObjectKey> {
    let metadata = object
        .get("metadata")
        .ok_or_else(|| SynchroError::RecordInvalid("object has no metadata".to_string()))?;
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SynchroError::RecordInvalid("object has no name".to_string()))?;
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok((namespace.to_string(), name.to_string()))
}

fn set_resource_version(object: &mut Value, revision: u64) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(revision.to_string()),
        );
    }
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                available: true,
                ..Default::default()
            }),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    /// Build a namespaced object of the given type
    pub fn object(resource: &ResourceType, namespace: Option<&str>, name: &str) -> Value {
        let mut metadata = json!({ "name": name, "uid": format!("uid-{}", name) });
        if let Some(ns) = namespace {
            metadata["namespace"] = json!(ns);
        }
        json!({
            "apiVersion": resource.gvr.api_version(),
            "kind": resource.kind,
            "metadata": metadata,
        })
    }

    /// Create or replace an object; returns its new resource version
    pub fn apply(&self, gvr: &GroupVersionResource, mut object: Value) -> Result<String> {
        let key = object_key(&object)?;
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        set_resource_version(&mut object, revision);

        let previous = state
            .objects
            .entry(gvr.clone())
            .or_default()
            .insert(key, object.clone());
        let event = match previous {
            Some(_) => WatchEvent::Modified(object),
            None => WatchEvent::Added(object),
        };
        state.publish(gvr, event);
        Ok(revision.to_string())
    }

    /// Delete an object; returns the deletion's resource version when it existed
    pub fn delete(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<String> {
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        let mut state = self.state.lock();
        let mut object = state.objects.get_mut(gvr)?.remove(&key)?;
        state.revision += 1;
        let revision = state.revision;
        set_resource_version(&mut object, revision);
        state.publish(gvr, WatchEvent::Deleted(object));
        Some(revision.to_string())
    }

    /// Send a bookmark at the current revision to open watches of a type
    pub fn bookmark(&self, gvr: &GroupVersionResource) {
        let mut state = self.state.lock();
        let rv = state.revision.to_string();
        state.watchers.retain(|(scope, tx)| {
            scope != gvr || tx.send(Ok(WatchEvent::Bookmark(rv.clone()))).is_ok()
        });
    }

    /// Forget history; watches from older versions fail as too old
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.compacted_through = state.revision;
        state.log.clear();
    }

    /// Tell every open watch its version expired, then close it
    pub fn expire_watches(&self) {
        let mut state = self.state.lock();
        for (_, tx) in state.watchers.drain(..) {
            let _ = tx.send(Err(SynchroError::ResourceVersionTooOld(
                "watch expired".to_string(),
            )));
        }
    }

    /// Close every open watch, as a dropped connection would
    pub fn disconnect(&self) {
        self.state.lock().watchers.clear();
    }

    /// Make the cluster reachable or not; going down closes open watches
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        if !available {
            state.watchers.clear();
        }
    }

    /// Jump the revision counter forward, as if other types had changed
    pub fn advance_to(&self, revision: u64) {
        let mut state = self.state.lock();
        state.revision = state.revision.max(revision);
    }

    pub fn revision(&self) -> String {
        self.state.lock().revision.to_string()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn open_watches(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|(_, tx)| !tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl ClusterClient for ScriptedCluster {
    async fn list(&self, resource: &ResourceType) -> Result<ListResult> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        state.check_available()?;
        Ok(ListResult {
            items: state
                .objects
                .get(&resource.gvr)
                .map(|objects| objects.values().cloned().collect())
                .unwrap_or_default(),
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        resource: &ResourceType,
        resource_version: &str,
    ) -> Result<ClusterEventStream> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let since: u64 = resource_version.parse().map_err(|_| {
            SynchroError::ResourceVersionTooOld(format!(
                "unparseable resource version '{}'",
                resource_version
            ))
        })?;

        let mut state = self.state.lock();
        state.check_available()?;
        if since < state.compacted_through {
            return Err(SynchroError::ResourceVersionTooOld(format!(
                "resource version {} is older than {}",
                since, state.compacted_through
            )));
        }

        let replayed: Vec<Result<WatchEvent>> = state
            .log
            .iter()
            .filter(|e| e.revision > since && e.gvr == resource.gvr)
            .map(|e| Ok(e.event.clone()))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push((resource.gvr.clone(), tx));

        Ok(stream::iter(replayed)
            .chain(UnboundedReceiverStream::new(rx))
            .boxed())
    }
}

/// Routes cluster names to scripted clusters
#[derive(Default)]
pub struct ScriptedConnector {
    clusters: Mutex<HashMap<String, Arc<ScriptedCluster>>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the cluster served under a name
    pub fn insert(&self, name: impl Into<String>, cluster: Arc<ScriptedCluster>) {
        self.clusters.lock().insert(name.into(), cluster);
    }

    /// Register a fresh cluster and return it
    pub fn add(&self, name: impl Into<String>) -> Arc<ScriptedCluster> {
        let cluster = Arc::new(ScriptedCluster::new());
        self.insert(name, cluster.clone());
        cluster
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for ScriptedConnector {
    async fn connect(&self, definition: &ClusterDefinition) -> Result<Arc<dyn ClusterClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let cluster = self.clusters.lock().get(&definition.name).cloned();
        match cluster {
            Some(cluster) => Ok(cluster),
            None => Err(SynchroError::ConnectionFailure(format!(
                "no route to cluster '{}'",
                definition.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceType {
        ResourceType::new(GroupVersionResource::new("", "v1", "pods"), "Pod")
    }

    #[tokio::test]
    async fn test_list_and_resume_watch() {
        let cluster = ScriptedCluster::new();
        let pods = pods();
        cluster
            .apply(&pods.gvr, ScriptedCluster::object(&pods, Some("ns"), "a"))
            .unwrap();
        let list = cluster.list(&pods).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.resource_version, "1");

        cluster
            .apply(&pods.gvr, ScriptedCluster::object(&pods, Some("ns"), "b"))
            .unwrap();
        let mut watch = cluster.watch(&pods, "1").await.unwrap();
        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.type_name(), "ADDED");
        assert_eq!(event.resource_version(), Some("2"));

        cluster.delete(&pods.gvr, Some("ns"), "a").unwrap();
        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.type_name(), "DELETED");
        assert_eq!(event.resource_version(), Some("3"));

        cluster.disconnect();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_compaction_and_outage() {
        let cluster = ScriptedCluster::new();
        let pods = pods();
        cluster
            .apply(&pods.gvr, ScriptedCluster::object(&pods, Some("ns"), "a"))
            .unwrap();
        cluster.compact();
        assert!(matches!(
            cluster.watch(&pods, "0").await.map(|_| ()),
            Err(SynchroError::ResourceVersionTooOld(_))
        ));

        cluster.set_available(false);
        assert!(matches!(
            cluster.list(&pods).await.map(|_| ()),
            Err(SynchroError::ConnectionFailure(_))
        ));
        assert_eq!(cluster.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_connector_routes_by_name() {
        use crate::types::ClusterConnection;

        let connector = ScriptedConnector::new();
        connector.add("a");
        let def = |name: &str| {
            ClusterDefinition::new(name, ClusterConnection::new("scripted://"), vec![pods()])
        };
        assert!(connector.connect(&def("a")).await.is_ok());
        assert!(connector.connect(&def("b")).await.is_err());
        assert_eq!(connector.connects(), 2);
    }
}
