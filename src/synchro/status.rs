//! Status publication for one synchro
//!
//! The synchro owns the only sender; readers hold `watch::Receiver`s and
//! always see a complete snapshot.

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::{GroupVersionResource, ResourceSyncStatus, SynchroPhase, SynchroStatus};

#[derive(Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<SynchroStatus>>,
}

impl StatusHandle {
    pub fn new(status: SynchroStatus) -> Self {
        let (tx, _) = watch::channel(status);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SynchroStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SynchroStatus {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> SynchroPhase {
        self.tx.borrow().phase
    }

    pub fn update(&self, f: impl FnOnce(&mut SynchroStatus)) {
        self.tx.send_modify(f);
    }

    pub fn set_phase(&self, phase: SynchroPhase) {
        self.tx.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }

    /// Update one resource type and keep the cluster-wide totals in step
    pub fn update_resource(
        &self,
        gvr: &GroupVersionResource,
        f: impl FnOnce(&mut ResourceSyncStatus),
    ) {
        let key = gvr.to_string();
        self.tx.send_modify(|status| {
            if let Some(resource) = status.resources.get_mut(&key) {
                f(resource);
            }
            status.queue_depth = status.resources.values().map(|r| r.queue_depth).sum();
        });
    }

    pub fn resource(&self, gvr: &GroupVersionResource) -> Option<ResourceSyncStatus> {
        self.tx.borrow().resources.get(&gvr.to_string()).cloned()
    }
}
