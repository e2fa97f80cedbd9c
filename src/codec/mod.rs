//! Conversion between cluster-native objects and stored records
//!
//! A native object is the JSON document a member cluster serves (`apiVersion`,
//! `kind`, `metadata`, ...). The codec only understands kinds registered with
//! it; anything else is rejected with `UnsupportedResourceKind` so callers can
//! skip it. The resource version is carried as an opaque string and never
//! interpreted here.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, SynchroError};
use crate::types::{GroupVersionKind, ResourceRecord, ResourceType};

/// Registered kinds, keyed by group/version/kind
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<GroupVersionKind, ResourceType>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: ResourceType) {
        self.kinds.insert(resource.gvk(), resource);
    }

    pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&ResourceType> {
        self.kinds.get(gvk)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl FromIterator<ResourceType> for KindRegistry {
    fn from_iter<I: IntoIterator<Item = ResourceType>>(iter: I) -> Self {
        let mut registry = KindRegistry::new();
        for resource in iter {
            registry.register(resource);
        }
        registry
    }
}

/// Encoder/decoder for one cluster's records
#[derive(Debug, Clone)]
pub struct ResourceCodec {
    cluster: String,
    registry: KindRegistry,
}

impl ResourceCodec {
    pub fn new(cluster: impl Into<String>, registry: KindRegistry) -> Self {
        Self {
            cluster: cluster.into(),
            registry,
        }
    }

    /// Codec for the resource types of a cluster definition
    pub fn for_resources(cluster: impl Into<String>, resources: &[ResourceType]) -> Self {
        Self::new(cluster, resources.iter().cloned().collect())
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Convert a native object into a storable record
    pub fn encode(&self, object: &Value) -> Result<ResourceRecord> {
        let fields = object
            .as_object()
            .ok_or_else(|| SynchroError::RecordInvalid("object is not a JSON map".to_string()))?;

        let api_version = required_str(fields, "apiVersion")?;
        let kind = required_str(fields, "kind")?;
        let gvk = GroupVersionKind::from_api_version(api_version, kind);

        let resource = self
            .registry
            .lookup(&gvk)
            .ok_or_else(|| SynchroError::UnsupportedResourceKind(gvk.to_string()))?;

        let metadata = fields
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                SynchroError::RecordInvalid(format!("{} object has no metadata", gvk))
            })?;

        let name = required_str(metadata, "name")?.to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        let namespace = match (resource.namespaced, namespace) {
            (true, None) => {
                return Err(SynchroError::RecordInvalid(format!(
                    "{} '{}' is namespaced but has no namespace",
                    gvk, name
                )))
            }
            (true, ns) => ns,
            (false, _) => None,
        };

        let resource_version = required_str(metadata, "resourceVersion")?.to_string();

        Ok(ResourceRecord {
            cluster: self.cluster.clone(),
            gvk,
            resource: resource.gvr.resource.clone(),
            namespace,
            name,
            uid: metadata
                .get("uid")
                .and_then(Value::as_str)
                .map(str::to_string),
            resource_version,
            labels: string_map(metadata, "labels")?,
            annotations: string_map(metadata, "annotations")?,
            created_at: metadata
                .get("creationTimestamp")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            last_seen: Utc::now(),
            payload: object.clone(),
            deleted: false,
        })
    }

    /// Convert a native object carried by a delete notification
    pub fn encode_tombstone(&self, object: &Value) -> Result<ResourceRecord> {
        let mut record = self.encode(object)?;
        record.deleted = true;
        Ok(record)
    }

    /// Convert a stored record back into its native object
    pub fn decode(&self, record: &ResourceRecord) -> Result<Value> {
        decode(record)
    }
}

/// Rebuild the native object of a record
///
/// The payload is stored verbatim; type and version fields are re-asserted
/// from the record so that a decoded object always agrees with its record.
pub fn decode(record: &ResourceRecord) -> Result<Value> {
    let mut object = match &record.payload {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(SynchroError::RecordInvalid(format!(
                "stored payload of {} is not a JSON map",
                record.identity()
            )))
        }
    };

    object.insert(
        "apiVersion".to_string(),
        Value::String(record.gvk.api_version()),
    );
    object.insert("kind".to_string(), Value::String(record.gvk.kind.clone()));

    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(metadata) = metadata {
        metadata.insert("name".to_string(), Value::String(record.name.clone()));
        if let Some(ns) = &record.namespace {
            metadata.insert("namespace".to_string(), Value::String(ns.clone()));
        }
        metadata.insert(
            "resourceVersion".to_string(),
            Value::String(record.resource_version.clone()),
        );
    }

    Ok(Value::Object(object))
}

fn required_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SynchroError::RecordInvalid(format!("missing or empty field '{}'", key)))
}

fn string_map(metadata: &Map<String, Value>, key: &str) -> Result<BTreeMap<String, String>> {
    match metadata.get(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Err(SynchroError::RecordInvalid(format!(
                    "metadata.{}.{} must be a string, got {}",
                    key, k, other
                ))),
            })
            .collect(),
        Some(other) => Err(SynchroError::RecordInvalid(format!(
            "metadata.{} must be a map, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupVersionResource;
    use serde_json::json;

    fn codec() -> ResourceCodec {
        ResourceCodec::for_resources(
            "cluster-a",
            &[
                ResourceType::new(GroupVersionResource::new("", "v1", "pods"), "Pod"),
                ResourceType::new(GroupVersionResource::new("", "v1", "nodes"), "Node")
                    .cluster_scoped(),
            ],
        )
    }

    fn pod(name: &str, rv: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": "3f1c",
                "resourceVersion": rv,
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "labels": {"app": "web"},
                "annotations": {"team": "infra"}
            },
            "spec": {"nodeName": "n1"}
        })
    }

    #[test]
    fn test_encode_pod() {
        let record = codec().encode(&pod("web-0", "00100")).unwrap();
        assert_eq!(record.cluster, "cluster-a");
        assert_eq!(record.resource, "pods");
        assert_eq!(record.namespace.as_deref(), Some("default"));
        assert_eq!(record.name, "web-0");
        // Leading zeros survive: the version is never parsed
        assert_eq!(record.resource_version, "00100");
        assert_eq!(record.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(record.annotations.len(), 1);
        assert!(record.created_at.is_some());
        assert!(!record.deleted);
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let object = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "default", "resourceVersion": "1"}
        });
        assert!(matches!(
            codec().encode(&object),
            Err(SynchroError::UnsupportedResourceKind(_))
        ));
    }

    #[test]
    fn test_invalid_objects() {
        let codec = codec();
        assert!(matches!(
            codec.encode(&json!("string")),
            Err(SynchroError::RecordInvalid(_))
        ));

        let no_rv = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "namespace": "ns"}});
        assert!(matches!(codec.encode(&no_rv), Err(SynchroError::RecordInvalid(_))));

        let no_ns = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p", "resourceVersion": "1"}});
        assert!(matches!(codec.encode(&no_ns), Err(SynchroError::RecordInvalid(_))));

        let bad_labels = json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "p", "namespace": "ns", "resourceVersion": "1", "labels": {"a": 1}}
        });
        assert!(matches!(codec.encode(&bad_labels), Err(SynchroError::RecordInvalid(_))));
    }

    #[test]
    fn test_cluster_scoped_ignores_namespace() {
        let node = json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": "n1", "namespace": "stray", "resourceVersion": "7"}
        });
        let record = codec().encode(&node).unwrap();
        assert!(record.namespace.is_none());
    }

    #[test]
    fn test_decode_restores_object() {
        let codec = codec();
        let original = pod("web-1", "42");
        let record = codec.encode(&original).unwrap();
        assert_eq!(codec.decode(&record).unwrap(), original);
    }

    #[test]
    fn test_tombstone() {
        let record = codec().encode_tombstone(&pod("web-2", "9")).unwrap();
        assert!(record.deleted);
    }
}
