//! Leadership capability
//!
//! Election itself is somebody else's job (a lease in the host cluster, a
//! lock service, ...). The manager only asks whether this replica leads and
//! listens for changes.

use tokio::sync::watch;

/// Source of leadership for the manager
pub trait LeaderElector: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Receiver that observes every leadership change
    fn leadership(&self) -> watch::Receiver<bool>;
}

/// Single-replica deployments: always the leader
pub struct AlwaysLeader {
    tx: watch::Sender<bool>,
}

impl AlwaysLeader {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }
}

impl Default for AlwaysLeader {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderElector for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Leadership driven from outside, e.g. by an election loop
pub struct LeaderFlag {
    tx: watch::Sender<bool>,
}

impl LeaderFlag {
    pub fn new(leader: bool) -> Self {
        let (tx, _) = watch::channel(leader);
        Self { tx }
    }

    /// Publish a leadership change; repeated values are not re-sent
    pub fn set(&self, leader: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
    }
}

impl LeaderElector for LeaderFlag {
    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
