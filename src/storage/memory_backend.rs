//! In-process implementation of the ResourceStorage trait
//!
//! Records live in one shard per cluster, so writers for different clusters
//! never contend. Each shard is a `BTreeMap` keyed by identity behind a
//! `parking_lot::RwLock`; the change log is appended while the shard's write
//! lock is held, which keeps per-identity event order equal to write order.
//!
//! Version order: configurable, `NumericAware` unless the storage
//! configuration says otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::backend::{
    validate_record, DeleteOutcome, HealthStatus, ListOptions, ListPage, ResourceStorage, StorageEventType,
    StorageFactory, StorageStats, UpsertOutcome, WatchStream,
};
use super::pagination::paginate;
use super::version::VersionOrder;
use super::watch::{parse_since, watch_stream, ChangeLog};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::types::{GroupVersionResource, ResourceIdentity, ResourceRecord};

/// Stored state of one identity
#[derive(Debug, Clone)]
enum Slot {
    Live(ResourceRecord),
    Tombstone {
        resource_version: String,
        /// Resource name, when the deleted object was known
        resource: Option<String>,
        deleted_at: DateTime<Utc>,
    },
}

impl Slot {
    fn resource_version(&self) -> &str {
        match self {
            Slot::Live(record) => &record.resource_version,
            Slot::Tombstone {
                resource_version, ..
            } => resource_version,
        }
    }
}

type Shard = Arc<RwLock<BTreeMap<ResourceIdentity, Slot>>>;

/// In-memory storage backend
pub struct MemoryBackend {
    shards: DashMap<String, Shard>,
    changes: Mutex<ChangeLog>,
    order: VersionOrder,
}

impl MemoryBackend {
    pub fn new(order: VersionOrder, watch_window: usize) -> Self {
        Self {
            shards: DashMap::new(),
            changes: Mutex::new(ChangeLog::new(watch_window)),
            order,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.version_order, config.watch_window)
    }

    fn shard(&self, cluster: &str) -> Shard {
        self.shards
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone()
    }

    fn existing_shard(&self, cluster: &str) -> Option<Shard> {
        self.shards.get(cluster).map(|s| s.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::from_config(&StorageConfig::memory())
    }
}

#[async_trait]
impl ResourceStorage for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn version_order(&self) -> VersionOrder {
        self.order
    }

    async fn upsert(&self, mut record: ResourceRecord) -> Result<UpsertOutcome> {
        validate_record(&record)?;
        record.deleted = false;

        let identity = record.identity();
        let gvr = record.gvr();
        let shard = self.shard(&record.cluster);
        let mut slots = shard.write();

        let outcome = match slots.get(&identity) {
            Some(slot) if !self.order.is_newer(&record.resource_version, slot.resource_version()) => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(Slot::Live(_)) => UpsertOutcome::Updated,
            Some(Slot::Tombstone { .. }) | None => UpsertOutcome::Created,
        };

        let event_type = match outcome {
            UpsertOutcome::Updated => StorageEventType::Modified,
            _ => StorageEventType::Added,
        };
        self.changes
            .lock()
            .append(event_type, &record.cluster, &gvr, Some(record.clone()));
        slots.insert(identity, Slot::Live(record));

        Ok(outcome)
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome> {
        let shard = self.shard(&identity.cluster);
        let mut slots = shard.write();

        if let (Some(slot), Some(rv)) = (slots.get(identity), resource_version) {
            if !self.order.is_at_least(rv, slot.resource_version()) {
                return Ok(DeleteOutcome::Absent);
            }
        }

        let resource = match slots.get(identity) {
            Some(Slot::Live(record)) => Some(record.resource.clone()),
            Some(Slot::Tombstone { resource, .. }) => resource.clone(),
            None => None,
        };
        let previous = match resource_version {
            Some(rv) => slots.insert(
                identity.clone(),
                Slot::Tombstone {
                    resource_version: rv.to_string(),
                    resource,
                    deleted_at: Utc::now(),
                },
            ),
            None => slots.remove(identity),
        };

        match previous {
            Some(Slot::Live(mut record)) => {
                let gvr = record.gvr();
                record.deleted = true;
                if let Some(rv) = resource_version {
                    record.resource_version = rv.to_string();
                }
                self.changes.lock().append(
                    StorageEventType::Deleted,
                    &identity.cluster,
                    &gvr,
                    Some(record),
                );
                Ok(DeleteOutcome::Deleted)
            }
            Some(tombstone @ Slot::Tombstone { .. }) if resource_version.is_none() => {
                // An unconditional delete of a tombstone keeps the tombstone
                slots.insert(identity.clone(), tombstone);
                Ok(DeleteOutcome::Absent)
            }
            _ => Ok(DeleteOutcome::Absent),
        }
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>> {
        let Some(shard) = self.existing_shard(&identity.cluster) else {
            return Ok(None);
        };
        let slots = shard.read();
        Ok(match slots.get(identity) {
            Some(Slot::Live(record)) => Some(record.clone()),
            _ => None,
        })
    }

    async fn list(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        options: &ListOptions,
    ) -> Result<ListPage> {
        let (candidates, revision) = match self.existing_shard(cluster) {
            Some(shard) => {
                let slots = shard.read();
                let revision = self.changes.lock().latest();
                let candidates = slots
                    .values()
                    .filter_map(|slot| match slot {
                        Slot::Live(record) if &record.gvr() == gvr => Some(record.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                (candidates, revision)
            }
            None => (Vec::new(), self.changes.lock().latest()),
        };

        paginate(candidates, options, &revision.to_string())
    }

    async fn watch(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: Option<&str>,
    ) -> Result<WatchStream> {
        let since = parse_since(since)?;
        let changes = self.changes.lock();
        let rx = changes.subscribe();
        let latest = changes.latest();
        let replayed = match since {
            Some(since) => changes.replay(cluster, gvr, since)?,
            None => Vec::new(),
        };
        drop(changes);

        Ok(watch_stream(replayed, rx, cluster, gvr, latest))
    }

    async fn purge_resource(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<usize> {
        let Some(shard) = self.existing_shard(cluster) else {
            return Ok(0);
        };
        let mut slots = shard.write();
        let doomed: Vec<ResourceIdentity> = slots
            .iter()
            .filter(|(id, slot)| match slot {
                Slot::Live(record) => &record.gvr() == gvr,
                Slot::Tombstone { resource, .. } => {
                    resource.as_deref() == Some(gvr.resource.as_str())
                        && id.gvk.group == gvr.group
                        && id.gvk.version == gvr.version
                }
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in doomed {
            if let Some(Slot::Live(mut record)) = slots.remove(&id) {
                record.deleted = true;
                self.changes
                    .lock()
                    .append(StorageEventType::Deleted, cluster, gvr, Some(record));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn purge_cluster(&self, cluster: &str) -> Result<usize> {
        let Some((_, shard)) = self.shards.remove(cluster) else {
            return Ok(0);
        };
        let slots = std::mem::take(&mut *shard.write());

        let mut changes = self.changes.lock();
        let mut removed = 0;
        for slot in slots.into_values() {
            if let Slot::Live(mut record) = slot {
                let gvr = record.gvr();
                record.deleted = true;
                changes.append(StorageEventType::Deleted, cluster, &gvr, Some(record));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn compact_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut slots = shard.write();
            let before = slots.len();
            slots.retain(|_, slot| match slot {
                Slot::Tombstone { deleted_at, .. } => *deleted_at >= older_than,
                Slot::Live(_) => true,
            });
            removed += before - slots.len();
        }
        Ok(removed)
    }

    async fn count(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<u64> {
        let Some(shard) = self.existing_shard(cluster) else {
            return Ok(0);
        };
        let slots = shard.read();
        Ok(slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(record) if &record.gvr() == gvr))
            .count() as u64)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            backend: self.backend_name().to_string(),
            ..Default::default()
        };
        let mut cluster_counts = HashMap::new();
        for shard in self.shards.iter() {
            let slots = shard.read();
            let mut live = 0u64;
            for slot in slots.values() {
                match slot {
                    Slot::Live(_) => live += 1,
                    Slot::Tombstone { .. } => stats.tombstone_count += 1,
                }
            }
            stats.record_count += live;
            cluster_counts.insert(shard.key().clone(), live);
        }
        stats.cluster_counts = cluster_counts;
        stats.revision = self.changes.lock().latest();
        Ok(stats)
    }

    async fn health(&self) -> HealthStatus {
        let start = Instant::now();
        let revision = self.changes.lock().latest();
        let mut status = HealthStatus {
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };
        status
            .details
            .insert("revision".to_string(), revision.to_string());
        status
            .details
            .insert("clusters".to_string(), self.shards.len().to_string());
        status
    }
}

/// Factory binding the in-memory backend
pub struct MemoryStorageFactory {
    storage: Arc<MemoryBackend>,
}

impl MemoryStorageFactory {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            storage: Arc::new(MemoryBackend::from_config(config)),
        }
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn resource_storage(&self) -> Arc<dyn ResourceStorage> {
        self.storage.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::debug!("memory storage shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SynchroError;
    use crate::types::GroupVersionKind;
    use futures::StreamExt;
    use serde_json::json;

    fn pods() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "pods")
    }

    fn pod(cluster: &str, name: &str, rv: &str) -> ResourceRecord {
        ResourceRecord {
            cluster: cluster.to_string(),
            gvk: GroupVersionKind::new("", "v1", "Pod"),
            resource: "pods".to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
            uid: None,
            resource_version: rv.to_string(),
            labels: Default::default(),
            annotations: Default::default(),
            created_at: None,
            last_seen: Utc::now(),
            payload: json!({"rv": rv}),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_monotonic() {
        let backend = MemoryBackend::default();
        assert_eq!(
            backend.upsert(pod("a", "p", "10")).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            backend.upsert(pod("a", "p", "9")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            backend.upsert(pod("a", "p", "10")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            backend.upsert(pod("a", "p", "11")).await.unwrap(),
            UpsertOutcome::Updated
        );
        let stored = backend
            .get(&pod("a", "p", "0").identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.resource_version, "11");
    }

    #[tokio::test]
    async fn test_tombstone_blocks_stale_resurrection() {
        let backend = MemoryBackend::default();
        let id = pod("a", "p", "0").identity();
        backend.upsert(pod("a", "p", "10")).await.unwrap();
        assert_eq!(
            backend.delete(&id, Some("12")).await.unwrap(),
            DeleteOutcome::Deleted
        );
        // Replayed older modification must not bring the object back
        assert_eq!(
            backend.upsert(pod("a", "p", "11")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert!(backend.get(&id).await.unwrap().is_none());
        // A genuinely newer object is a re-creation
        assert_eq!(
            backend.upsert(pod("a", "p", "13")).await.unwrap(),
            UpsertOutcome::Created
        );
    }

    #[tokio::test]
    async fn test_stale_delete_ignored() {
        let backend = MemoryBackend::default();
        let id = pod("a", "p", "0").identity();
        backend.upsert(pod("a", "p", "20")).await.unwrap();
        assert_eq!(
            backend.delete(&id, Some("15")).await.unwrap(),
            DeleteOutcome::Absent
        );
        assert!(backend.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_record_rejected() {
        let backend = MemoryBackend::default();
        let result = backend.upsert(pod("a", "p", "")).await;
        assert!(matches!(result, Err(SynchroError::RecordInvalid(_))));
    }

    #[tokio::test]
    async fn test_purge_cluster_and_stats() {
        let backend = MemoryBackend::default();
        backend.upsert(pod("a", "p1", "1")).await.unwrap();
        backend.upsert(pod("a", "p2", "1")).await.unwrap();
        backend.upsert(pod("b", "p1", "1")).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.record_count, 3);
        assert_eq!(stats.cluster_counts.get("a"), Some(&2));

        assert_eq!(backend.purge_cluster("a").await.unwrap(), 2);
        assert_eq!(backend.count("a", &pods()).await.unwrap(), 0);
        assert_eq!(backend.count("b", &pods()).await.unwrap(), 1);
        assert_eq!(backend.purge_cluster("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compact_tombstones() {
        let backend = MemoryBackend::default();
        let id = pod("a", "p", "0").identity();
        backend.delete(&id, Some("5")).await.unwrap();
        assert_eq!(backend.stats().await.unwrap().tombstone_count, 1);
        let removed = backend
            .compact_tombstones(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.stats().await.unwrap().tombstone_count, 0);
    }

    #[tokio::test]
    async fn test_watch_resume_and_too_old() {
        let backend = MemoryBackend::new(VersionOrder::NumericAware, 2);
        for name in ["p1", "p2", "p3", "p4"] {
            backend.upsert(pod("a", name, "1")).await.unwrap();
        }

        assert!(matches!(
            backend.watch("a", &pods(), Some("0")).await.map(|_| ()),
            Ok(())
        ));
        assert!(matches!(
            backend.watch("a", &pods(), Some("1")).await.map(|_| ()),
            Err(SynchroError::ResourceVersionTooOld(_))
        ));

        let mut stream = backend.watch("a", &pods(), Some("2")).await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, StorageEventType::Added);
        assert_eq!(event.record.unwrap().name, "p3");
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.record.unwrap().name, "p4");
        let bookmark = stream.next().await.unwrap().unwrap();
        assert_eq!(bookmark.event_type, StorageEventType::Bookmark);

        backend
            .delete(&pod("a", "p1", "0").identity(), Some("2"))
            .await
            .unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, StorageEventType::Deleted);
        assert!(event.record.unwrap().deleted);
    }
}
