//! Core types for clustersynchro

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, SynchroError};

/// Maximum length of a cluster name
pub const MAX_CLUSTER_NAME_LENGTH: usize = 253;

/// Group/version/kind of a cluster-native object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build from an `apiVersion` string ("v1" or "apps/v1") and a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Render as an `apiVersion` string
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Group/version/resource, the unit a synchro lists and watches
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// A resource type registered for synchronization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceType {
    #[serde(flatten)]
    pub gvr: GroupVersionResource,
    /// Kind served under this resource (e.g. `Pod` for `pods`)
    pub kind: String,
    /// Whether objects of this type live in a namespace
    #[serde(default = "default_true")]
    pub namespaced: bool,
}

impl ResourceType {
    pub fn new(gvr: GroupVersionResource, kind: impl Into<String>) -> Self {
        Self {
            gvr,
            kind: kind.into(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.gvr.group, &self.gvr.version, &self.kind)
    }
}

/// Unique identity of a stored resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub cluster: String,
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        cluster: impl Into<String>,
        gvk: GroupVersionKind,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            gvk,
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }

    /// Namespace as stored by backends (empty string for cluster-scoped)
    pub fn namespace_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", self.cluster, self.gvk, ns, self.name),
            None => write!(f, "{}/{}/{}", self.cluster, self.gvk, self.name),
        }
    }
}

/// The stored representation of one cluster-native object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub cluster: String,
    pub gvk: GroupVersionKind,
    /// Plural resource name the object was synced under
    pub resource: String,
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
    /// Opaque ordering token from the source cluster
    pub resource_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub deleted: bool,
}

impl ResourceRecord {
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(
            self.cluster.clone(),
            self.gvk.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }

    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.gvk.group, &self.gvk.version, &self.resource)
    }

    pub fn namespace_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// Connection parameters for a member cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterConnection {
    /// API server endpoint, e.g. `https://10.0.0.1:6443`
    pub endpoint: String,
    /// Reference to the credentials secret, opaque to this crate
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// File holding a bearer token
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Overrides the configured request timeout for this cluster
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl ClusterConnection {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials_ref: None,
            token_file: None,
            insecure_skip_tls_verify: false,
            request_timeout_ms: None,
        }
    }
}

/// Readiness policy of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    /// How long a resource type may stay in error before the cluster is
    /// unready; unset means the manager-wide default
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
}

impl ReadinessPolicy {
    pub fn grace_period(&self, fallback: std::time::Duration) -> std::time::Duration {
        self.grace_period_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or(fallback)
    }
}

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    1
}

/// Definition of a cluster to synchronize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub name: String,
    pub connection: ClusterConnection,
    pub resources: Vec<ResourceType>,
    /// Number of concurrent storage writers per resource type
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub readiness: ReadinessPolicy,
}

impl ClusterDefinition {
    pub fn new(
        name: impl Into<String>,
        connection: ClusterConnection,
        resources: Vec<ResourceType>,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            resources,
            worker_count: default_worker_count(),
            readiness: ReadinessPolicy::default(),
        }
    }

    /// Check the definition is usable; failures are fatal for its synchro
    pub fn validate(&self) -> Result<()> {
        validate_cluster_name(&self.name)?;

        if self.connection.endpoint.trim().is_empty() {
            return Err(SynchroError::DefinitionInvalid(format!(
                "cluster '{}' has an empty endpoint",
                self.name
            )));
        }

        if self.resources.is_empty() {
            return Err(SynchroError::DefinitionInvalid(format!(
                "cluster '{}' does not sync any resource type",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            if resource.gvr.version.is_empty()
                || resource.gvr.resource.is_empty()
                || resource.kind.is_empty()
            {
                return Err(SynchroError::DefinitionInvalid(format!(
                    "cluster '{}' has an incomplete resource type {}",
                    self.name, resource.gvr
                )));
            }
            if !seen.insert(&resource.gvr) {
                return Err(SynchroError::DefinitionInvalid(format!(
                    "cluster '{}' lists resource type {} twice",
                    self.name, resource.gvr
                )));
            }
        }

        if self.worker_count == 0 {
            return Err(SynchroError::DefinitionInvalid(format!(
                "cluster '{}' has a worker count of zero",
                self.name
            )));
        }

        Ok(())
    }

    /// Hash of everything that requires a synchro restart when changed
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "connection": self.connection,
            "resources": self.resources,
            "worker_count": self.worker_count,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Validate a cluster name (DNS-1123 subdomain-ish)
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SynchroError::DefinitionInvalid(
            "cluster name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_CLUSTER_NAME_LENGTH {
        return Err(SynchroError::DefinitionInvalid(format!(
            "cluster name '{}' exceeds {} characters",
            name, MAX_CLUSTER_NAME_LENGTH
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
        && name
            .chars()
            .last()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false);
    if !valid_chars || !valid_edges {
        return Err(SynchroError::DefinitionInvalid(format!(
            "cluster name '{}' must be lowercase alphanumeric, '-' or '.'",
            name
        )));
    }
    Ok(())
}

/// Lifecycle phase of a cluster synchro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum SynchroPhase {
    #[default]
    Pending,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SynchroPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchroPhase::Pending => "Pending",
            SynchroPhase::Running => "Running",
            SynchroPhase::Stopping => "Stopping",
            SynchroPhase::Stopped => "Stopped",
            SynchroPhase::Error => "Error",
        }
    }
}

impl fmt::Display for SynchroPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state of one resource type within a running synchro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ResourceSyncState {
    #[default]
    Listing,
    Watching,
    Resyncing,
    /// Waiting out a backoff delay after a failure
    Backoff,
}

/// High-water mark of one (cluster, resource type)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Resource version through which events have been fully applied
    pub resource_version: Option<String>,
    /// Whether at least one full list has completed
    pub listed: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn advance(&mut self, resource_version: &str) {
        self.resource_version = Some(resource_version.to_string());
        self.updated_at = Some(Utc::now());
    }
}

/// Status of one resource type within a synchro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSyncStatus {
    pub resource: ResourceType,
    pub state: ResourceSyncState,
    pub cursor: SyncCursor,
    /// Storage writes have been failing past the degraded threshold
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Objects observed in the latest full list plus net watch adds
    pub object_count: u64,
    pub queue_depth: usize,
}

impl ResourceSyncStatus {
    pub fn new(resource: ResourceType) -> Self {
        Self {
            resource,
            state: ResourceSyncState::Listing,
            cursor: SyncCursor::default(),
            degraded: false,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            object_count: 0,
            queue_depth: 0,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.last_error_at = Some(Utc::now());
    }

    pub fn record_success(&mut self) {
        self.last_success_at = Some(Utc::now());
    }

    /// An error is unresolved when no success happened after it
    pub fn unresolved_error_since(&self) -> Option<DateTime<Utc>> {
        let error_at = self.last_error_at?;
        match self.last_success_at {
            Some(success_at) if success_at > error_at => None,
            _ => Some(error_at),
        }
    }
}

/// Per-cluster summary published by a synchro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchroStatus {
    pub cluster: String,
    /// Identifies one run; changes whenever the synchro is recreated
    pub run_id: Uuid,
    pub phase: SynchroPhase,
    /// Keyed by the resource type's display form (`apps/v1/deployments`)
    pub resources: BTreeMap<String, ResourceSyncStatus>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub started_at: DateTime<Utc>,
}

impl SynchroStatus {
    pub fn new(cluster: impl Into<String>, resources: &[ResourceType]) -> Self {
        Self {
            cluster: cluster.into(),
            run_id: Uuid::new_v4(),
            phase: SynchroPhase::Pending,
            resources: resources
                .iter()
                .map(|r| (r.gvr.to_string(), ResourceSyncStatus::new(r.clone())))
                .collect(),
            last_error: None,
            last_error_at: None,
            queue_depth: 0,
            started_at: Utc::now(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.last_error_at = Some(Utc::now());
    }

    pub fn cursor(&self, gvr: &GroupVersionResource) -> Option<&SyncCursor> {
        self.resources.get(&gvr.to_string()).map(|r| &r.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceType {
        ResourceType::new(GroupVersionResource::new("", "v1", "pods"), "Pod")
    }

    fn definition() -> ClusterDefinition {
        ClusterDefinition::new(
            "cluster-a",
            ClusterConnection::new("https://10.0.0.1:6443"),
            vec![pods()],
        )
    }

    #[test]
    fn test_gvk_api_version_round_trip() {
        let core = GroupVersionKind::from_api_version("v1", "Pod");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");

        let apps = GroupVersionKind::from_api_version("apps/v1", "Deployment");
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.api_version(), "apps/v1");
    }

    #[test]
    fn test_gvr_display() {
        assert_eq!(GroupVersionResource::new("", "v1", "pods").to_string(), "v1/pods");
        assert_eq!(
            GroupVersionResource::new("apps", "v1", "deployments").to_string(),
            "apps/v1/deployments"
        );
    }

    #[test]
    fn test_identity_drops_empty_namespace() {
        let id = ResourceIdentity::new(
            "c",
            GroupVersionKind::new("", "v1", "Node"),
            Some(String::new()),
            "n1",
        );
        assert!(id.namespace.is_none());
        assert_eq!(id.namespace_key(), "");
    }

    #[test]
    fn test_definition_validation() {
        assert!(definition().validate().is_ok());

        let mut empty = definition();
        empty.resources.clear();
        assert!(matches!(
            empty.validate(),
            Err(SynchroError::DefinitionInvalid(_))
        ));

        let mut dup = definition();
        dup.resources.push(pods());
        assert!(dup.validate().is_err());

        let mut bad_name = definition();
        bad_name.name = "Cluster_A".to_string();
        assert!(bad_name.validate().is_err());

        let mut no_endpoint = definition();
        no_endpoint.connection.endpoint = " ".to_string();
        assert!(no_endpoint.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_restart_relevant_fields() {
        let a = definition();
        let mut b = definition();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.connection.endpoint = "https://10.0.0.2:6443".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = definition();
        c.resources.push(ResourceType::new(
            GroupVersionResource::new("apps", "v1", "deployments"),
            "Deployment",
        ));
        assert_ne!(a.fingerprint(), c.fingerprint());

        let mut d = definition();
        d.readiness.grace_period_secs = Some(5);
        assert_eq!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_unresolved_error() {
        let mut status = ResourceSyncStatus::new(pods());
        assert!(status.unresolved_error_since().is_none());
        status.record_error("boom");
        assert!(status.unresolved_error_since().is_some());
        std::thread::sleep(std::time::Duration::from_millis(2));
        status.record_success();
        assert!(status.unresolved_error_since().is_none());
    }
}
