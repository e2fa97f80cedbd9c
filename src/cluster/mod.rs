//! Outbound access to member clusters
//!
//! A synchro talks to its cluster only through [`ClusterClient`]: a full list
//! of one resource type and a watch resuming from a resource version. The
//! [`ClusterConnector`] builds a client from a cluster definition, so the
//! manager can be pointed at real API servers or at a [`ScriptedCluster`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ClusterDefinition, ResourceType};

#[cfg(feature = "http-client")]
pub mod http;
pub mod scripted;

#[cfg(feature = "http-client")]
pub use http::{HttpClusterClient, HttpConnector};
pub use scripted::{ScriptedCluster, ScriptedConnector};

/// One notification from a cluster watch
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

impl WatchEvent {
    /// Resource version the event brings the watch to
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(object)
            | WatchEvent::Modified(object)
            | WatchEvent::Deleted(object) => object
                .get("metadata")
                .and_then(|m| m.get("resourceVersion"))
                .and_then(Value::as_str),
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark(_) => "BOOKMARK",
        }
    }
}

/// Result of a full list
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Native objects, each with `apiVersion` and `kind` set
    pub items: Vec<Value>,
    /// Collection resource version to start watching from
    pub resource_version: String,
}

/// Stream of watch notifications; ends when the server closes the watch
pub type ClusterEventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// List/watch access to one member cluster
///
/// Errors: `ConnectionFailure` for transport problems (retryable), and
/// `ResourceVersionTooOld` when a watch cannot resume from the given
/// version, either from `watch` itself or as a stream item.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Full list of one resource type
    ///
    /// Implementations page through the collection and put a deadline on
    /// every request they make; callers do not bound the whole call.
    async fn list(&self, resource: &ResourceType) -> Result<ListResult>;

    async fn watch(
        &self,
        resource: &ResourceType,
        resource_version: &str,
    ) -> Result<ClusterEventStream>;
}

/// Builds clients from cluster definitions
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, definition: &ClusterDefinition) -> Result<Arc<dyn ClusterClient>>;
}
