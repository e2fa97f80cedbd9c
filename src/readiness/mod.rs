//! Per-cluster readiness derived from synchro status
//!
//! A cluster is ready when its synchro is `Running`, every resource type has
//! completed a full list, and no resource type carries an error older than
//! the cluster's grace period that a later success has not cleared. The
//! tracker only reads status snapshots; it never talks to clusters or
//! storage on its own, except for [`ReadinessTracker::overall_health`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::SynchroConfig;
use crate::storage::{HealthStatus, ResourceStorage};
use crate::types::{ReadinessPolicy, SynchroPhase, SynchroStatus};

/// Readiness verdict for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterReadiness {
    pub cluster: String,
    pub ready: bool,
    /// Why the cluster is not ready; empty when ready
    pub reasons: Vec<String>,
}

/// Evaluate one status snapshot at `now`
pub fn evaluate(status: &SynchroStatus, grace: Duration, now: DateTime<Utc>) -> ClusterReadiness {
    let mut reasons = Vec::new();

    if status.phase != SynchroPhase::Running {
        reasons.push(format!("synchro is {}", status.phase));
    }

    let grace =
        chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    for (key, resource) in &status.resources {
        if !resource.cursor.listed {
            reasons.push(format!("{} has not completed a full list", key));
        }
        if let Some(since) = resource.unresolved_error_since() {
            if now - since > grace {
                reasons.push(format!(
                    "{} failing since {}: {}",
                    key,
                    since.to_rfc3339(),
                    resource.last_error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }

    ClusterReadiness {
        cluster: status.cluster.clone(),
        ready: reasons.is_empty(),
        reasons,
    }
}

struct Tracked {
    status: watch::Receiver<SynchroStatus>,
    grace: Duration,
}

/// Combined view of storage health and cluster readiness
#[derive(Debug, Clone)]
pub struct OverallHealth {
    pub storage: HealthStatus,
    pub clusters: BTreeMap<String, ClusterReadiness>,
}

impl OverallHealth {
    /// Storage is healthy and every tracked cluster is ready
    pub fn healthy(&self) -> bool {
        self.storage.healthy && self.clusters.values().all(|c| c.ready)
    }

    pub fn ready_count(&self) -> usize {
        self.clusters.values().filter(|c| c.ready).count()
    }
}

/// Readiness of every cluster the manager runs
pub struct ReadinessTracker {
    clusters: DashMap<String, Tracked>,
    default_grace: Duration,
}

impl ReadinessTracker {
    pub fn new(default_grace: Duration) -> Self {
        Self {
            clusters: DashMap::new(),
            default_grace,
        }
    }

    pub fn from_config(config: &SynchroConfig) -> Arc<Self> {
        Arc::new(Self::new(config.readiness_grace_period()))
    }

    /// Follow a synchro's status, replacing any earlier receiver for the cluster
    pub fn track(
        &self,
        cluster: impl Into<String>,
        status: watch::Receiver<SynchroStatus>,
        policy: &ReadinessPolicy,
    ) {
        self.clusters.insert(
            cluster.into(),
            Tracked {
                status,
                grace: policy.grace_period(self.default_grace),
            },
        );
    }

    /// Apply a changed readiness policy without replacing the receiver
    pub fn set_policy(&self, cluster: &str, policy: &ReadinessPolicy) {
        if let Some(mut tracked) = self.clusters.get_mut(cluster) {
            tracked.grace = policy.grace_period(self.default_grace);
        }
    }

    pub fn untrack(&self, cluster: &str) {
        self.clusters.remove(cluster);
    }

    pub fn is_tracked(&self, cluster: &str) -> bool {
        self.clusters.contains_key(cluster)
    }

    pub fn clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Latest status snapshot of a cluster
    pub fn snapshot(&self, cluster: &str) -> Option<SynchroStatus> {
        self.clusters
            .get(cluster)
            .map(|tracked| tracked.status.borrow().clone())
    }

    pub fn readiness(&self, cluster: &str) -> ClusterReadiness {
        match self.clusters.get(cluster) {
            Some(tracked) => evaluate(&tracked.status.borrow(), tracked.grace, Utc::now()),
            None => ClusterReadiness {
                cluster: cluster.to_string(),
                ready: false,
                reasons: vec!["cluster is not tracked".to_string()],
            },
        }
    }

    pub fn is_ready(&self, cluster: &str) -> bool {
        self.readiness(cluster).ready
    }

    /// Tracked clusters that are currently not ready
    pub fn stale_clusters(&self) -> Vec<String> {
        self.clusters()
            .into_iter()
            .filter(|name| !self.is_ready(name))
            .collect()
    }

    pub fn all(&self) -> BTreeMap<String, ClusterReadiness> {
        self.clusters()
            .into_iter()
            .map(|name| {
                let readiness = self.readiness(&name);
                (name, readiness)
            })
            .collect()
    }

    /// Storage health check together with readiness of every cluster
    pub async fn overall_health(&self, storage: &dyn ResourceStorage) -> OverallHealth {
        OverallHealth {
            storage: storage.health().await,
            clusters: self.all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::types::{GroupVersionResource, ResourceType};
    use pretty_assertions::assert_eq;

    fn pods() -> ResourceType {
        ResourceType::new(GroupVersionResource::new("", "v1", "pods"), "Pod")
    }

    fn running_listed() -> SynchroStatus {
        let mut status = SynchroStatus::new("a", &[pods()]);
        status.phase = SynchroPhase::Running;
        for resource in status.resources.values_mut() {
            resource.cursor.listed = true;
        }
        status
    }

    #[test]
    fn test_requires_running_and_listed() {
        let now = Utc::now();
        let grace = Duration::from_secs(60);

        let pending = SynchroStatus::new("a", &[pods()]);
        let verdict = evaluate(&pending, grace, now);
        assert!(!verdict.ready);
        assert_eq!(verdict.reasons.len(), 2);

        assert!(evaluate(&running_listed(), grace, now).ready);
    }

    #[test]
    fn test_errors_within_grace_keep_ready() {
        let grace = Duration::from_secs(60);
        let mut status = running_listed();
        let resource = status.resources.values_mut().next().unwrap();
        resource.record_error("connection reset");
        let error_at = resource.last_error_at.unwrap();

        assert!(evaluate(&status, grace, error_at + chrono::Duration::seconds(30)).ready);

        let late = evaluate(&status, grace, error_at + chrono::Duration::seconds(61));
        assert!(!late.ready);
        assert!(late.reasons[0].contains("connection reset"));

        let resource = status.resources.values_mut().next().unwrap();
        resource.last_success_at = Some(error_at + chrono::Duration::seconds(1));
        assert!(evaluate(&status, grace, error_at + chrono::Duration::seconds(120)).ready);
    }

    #[tokio::test]
    async fn test_tracker_follows_receivers() {
        let tracker = ReadinessTracker::new(Duration::from_secs(60));
        assert!(!tracker.is_ready("a"));

        let (tx, rx) = watch::channel(SynchroStatus::new("a", &[pods()]));
        tracker.track("a", rx, &ReadinessPolicy::default());
        assert_eq!(tracker.stale_clusters(), vec!["a".to_string()]);

        tx.send(running_listed()).unwrap();
        assert!(tracker.is_ready("a"));
        assert!(tracker.stale_clusters().is_empty());
        assert_eq!(tracker.snapshot("a").unwrap().phase, SynchroPhase::Running);

        let health = tracker.overall_health(&MemoryBackend::default()).await;
        assert!(health.healthy());
        assert_eq!(health.ready_count(), 1);

        tracker.untrack("a");
        assert!(!tracker.is_tracked("a"));
    }

    #[test]
    fn test_policy_overrides_default_grace() {
        let tracker = ReadinessTracker::new(Duration::from_secs(600));
        let mut status = running_listed();
        let resource = status.resources.values_mut().next().unwrap();
        resource.record_error("boom");
        resource.last_error_at = Some(Utc::now() - chrono::Duration::seconds(30));

        let (_tx, rx) = watch::channel(status);
        tracker.track("a", rx, &ReadinessPolicy::default());
        assert!(tracker.is_ready("a"));

        tracker.set_policy(
            "a",
            &ReadinessPolicy {
                grace_period_secs: Some(10),
            },
        );
        assert!(!tracker.is_ready("a"));
    }
}
