//! Storage contract shared by every backend
//!
//! This module defines the `ResourceStorage` trait that all storage backends
//! must implement, plus the `StorageFactory` through which a process binds one
//! backend at startup. Synchros write through it and the query layer reads
//! through it; neither knows which engine sits underneath.
//!
//! # Guarantees every backend provides
//!
//! 1. **Per-identity atomicity**: an upsert or delete of one identity is
//!    applied entirely or not at all, and concurrent writers to the same
//!    identity are serialized.
//!
//! 2. **Monotonic versions**: the stored resource version of an identity never
//!    moves backward under the backend's documented [`VersionOrder`]. Replayed
//!    or reordered writes are no-ops, not errors.
//!
//! 3. **Deterministic pages**: list pages are cut by keyset continue tokens, so
//!    a data set that does not change while it is paged is returned without
//!    gaps or duplicates.
//!
//! 4. **Resumable watches**: change events carry a backend revision; a watch
//!    can resume from any revision still inside the retained change window,
//!    and fails with `ResourceVersionTooOld` otherwise.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use super::filter::Predicate;
use super::version::VersionOrder;
use crate::error::{Result, SynchroError};
use crate::types::{GroupVersionResource, ResourceIdentity, ResourceRecord};

/// Outcome of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No live record existed for the identity
    Created,
    /// A live record was replaced by a newer version
    Updated,
    /// The incoming version was not newer; nothing was written
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_write(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Outcome of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A live record was removed
    Deleted,
    /// Nothing live to delete, or the delete was older than the stored record
    Absent,
}

/// Fields records can be sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Name,
    Namespace,
    CreatedAt,
    LastSeen,
    /// Numeric-aware resource version order
    ResourceVersion,
}

/// Sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for listing records of one (cluster, resource type)
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Label / annotation predicate supplied by the caller
    pub predicate: Option<Predicate>,
    /// Maximum number of results (None = everything)
    pub limit: Option<usize>,
    /// Token returned by the previous page
    pub continue_token: Option<String>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

/// One page of list results
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<ResourceRecord>,
    /// Present when more rows follow
    pub continue_token: Option<String>,
    /// Rows after this page, when more rows follow
    pub remaining_item_count: Option<u64>,
    /// Storage revision a watch can resume from after this list
    pub revision: String,
}

/// Type of a storage change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageEventType {
    Added,
    Modified,
    Deleted,
    /// Progress marker without a record
    Bookmark,
}

/// A change observed by a storage watch
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub event_type: StorageEventType,
    /// Backend revision of this change
    pub revision: u64,
    pub cluster: String,
    pub gvr: GroupVersionResource,
    /// The record after the change (the last live state for deletions)
    pub record: Option<ResourceRecord>,
}

impl StorageEvent {
    pub fn bookmark(cluster: &str, gvr: &GroupVersionResource, revision: u64) -> Self {
        Self {
            event_type: StorageEventType::Bookmark,
            revision,
            cluster: cluster.to_string(),
            gvr: gvr.clone(),
            record: None,
        }
    }

    pub fn revision_token(&self) -> String {
        self.revision.to_string()
    }
}

/// Lazy, single-subscriber stream of storage changes
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<StorageEvent>> + Send>>;

/// Statistics about the storage backend
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Live records
    pub record_count: u64,
    /// Deletion tombstones retained for replay protection
    pub tombstone_count: u64,
    /// Live records per cluster
    pub cluster_counts: HashMap<String, u64>,
    /// Latest storage revision
    pub revision: u64,
    /// Backend name
    pub backend: String,
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the backend is healthy
    pub healthy: bool,
    /// Latency of the check in milliseconds
    pub latency_ms: f64,
    /// Optional error message if unhealthy
    pub error: Option<String>,
    /// Additional health details
    pub details: HashMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0.0,
            error: None,
            details: HashMap::new(),
        }
    }
}

impl HealthStatus {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Reject records no backend can store
pub(crate) fn validate_record(record: &ResourceRecord) -> Result<()> {
    if record.cluster.is_empty() || record.name.is_empty() {
        return Err(SynchroError::RecordInvalid(
            "record needs a cluster and a name".to_string(),
        ));
    }
    if record.resource_version.is_empty() {
        return Err(SynchroError::RecordInvalid(format!(
            "record {} has an empty resource version",
            record.identity()
        )));
    }
    if record.resource.is_empty() {
        return Err(SynchroError::RecordInvalid(format!(
            "record {} has no resource name",
            record.identity()
        )));
    }
    Ok(())
}

/// The storage contract every backend implements
///
/// All operations are scoped to one cluster and one resource type unless
/// noted. Methods take `&self`; backends use interior mutability and must be
/// safe to share between every synchro and the query layer.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Backend name, as registered
    fn backend_name(&self) -> &'static str;

    /// The backend's total order over resource versions
    fn version_order(&self) -> VersionOrder;

    /// Compare two resource versions under the backend's order
    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        self.version_order().compare(a, b)
    }

    /// Insert or replace a record by identity
    ///
    /// The write happens only when the incoming resource version is newer
    /// than the stored one (live or tombstone); otherwise it is a no-op.
    async fn upsert(&self, record: ResourceRecord) -> Result<UpsertOutcome>;

    /// Delete a record by identity
    ///
    /// Idempotent. With a resource version, the delete is ignored when the
    /// stored record is newer, and a tombstone is kept so that older replayed
    /// upserts cannot resurrect the object.
    async fn delete(
        &self,
        identity: &ResourceIdentity,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome>;

    /// Get a live record by identity
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>>;

    /// List one page of live records
    async fn list(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        options: &ListOptions,
    ) -> Result<ListPage>;

    /// Watch changes after a storage revision
    ///
    /// `since` of `None`, `""` or `"0"` starts at the current revision.
    async fn watch(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: Option<&str>,
    ) -> Result<WatchStream>;

    /// Remove every record (and tombstone) of one resource type of a cluster
    async fn purge_resource(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<usize>;

    /// Remove every record (and tombstone) of a cluster
    async fn purge_cluster(&self, cluster: &str) -> Result<usize>;

    /// Drop tombstones last touched before the given time
    async fn compact_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Count live records of one resource type
    async fn count(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<u64> {
        // Default: page through everything (backends should override)
        let mut options = ListOptions {
            limit: Some(super::pagination::MAX_PAGE_SIZE),
            ..Default::default()
        };
        let mut total = 0u64;
        loop {
            let page = self.list(cluster, gvr, &options).await?;
            total += page.items.len() as u64;
            match page.continue_token {
                Some(token) => options.continue_token = Some(token),
                None => return Ok(total),
            }
        }
    }

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats>;

    /// Cheap liveness check; must not scan
    async fn health(&self) -> HealthStatus;
}

/// A process-wide binding to one concrete backend
#[async_trait]
pub trait StorageFactory: Send + Sync {
    /// Name the backend was registered under
    fn name(&self) -> &'static str;

    /// Shared handle to the resource storage
    fn resource_storage(&self) -> Arc<dyn ResourceStorage>;

    /// Backend health
    async fn health(&self) -> HealthStatus {
        self.resource_storage().health().await
    }

    /// Flush and close; the factory must not be used afterwards
    async fn shutdown(&self) -> Result<()>;
}
