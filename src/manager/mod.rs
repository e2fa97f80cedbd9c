//! Synchro manager: reconciles cluster definitions into running synchros
//!
//! The manager consumes [`DefinitionEvent`]s and keeps one [`ClusterSynchro`]
//! per known definition. At most `max_concurrent_synchros` run at once;
//! the rest wait in `Pending` for a permit. Only the leader runs synchros:
//! followers record definitions, and losing leadership stops everything
//! without touching stored data.

pub mod leader;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterConnector;
use crate::config::{RemovalPolicy, SynchroConfig};
use crate::error::{Result, SynchroError};
use crate::readiness::ReadinessTracker;
use crate::storage::ResourceStorage;
use crate::synchro::{with_deadline, Backoff, ClusterSynchro};
use crate::types::{ClusterDefinition, SynchroPhase, SynchroStatus};

pub use leader::{AlwaysLeader, LeaderElector, LeaderFlag};

/// Change notification for cluster definitions
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionEvent {
    Added(ClusterDefinition),
    Updated(ClusterDefinition),
    Removed(String),
}

impl DefinitionEvent {
    pub fn name(&self) -> &str {
        match self {
            DefinitionEvent::Added(d) | DefinitionEvent::Updated(d) => &d.name,
            DefinitionEvent::Removed(name) => name,
        }
    }
}

/// Supervisor of every cluster synchro in the process
pub struct SynchroManager {
    storage: Arc<dyn ResourceStorage>,
    connector: Arc<dyn ClusterConnector>,
    config: SynchroConfig,
    leader: Arc<dyn LeaderElector>,
    readiness: Arc<ReadinessTracker>,
    permits: Arc<Semaphore>,
    definitions: RwLock<BTreeMap<String, ClusterDefinition>>,
    synchros: DashMap<String, Arc<ClusterSynchro>>,
    /// Serializes reconciliation steps
    reconcile: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl SynchroManager {
    pub fn new(
        storage: Arc<dyn ResourceStorage>,
        connector: Arc<dyn ClusterConnector>,
        config: SynchroConfig,
        leader: Arc<dyn LeaderElector>,
    ) -> Self {
        Self {
            readiness: ReadinessTracker::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent_synchros)),
            storage,
            connector,
            config,
            leader,
            definitions: RwLock::new(BTreeMap::new()),
            synchros: DashMap::new(),
            reconcile: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn readiness(&self) -> Arc<ReadinessTracker> {
        self.readiness.clone()
    }

    pub fn storage(&self) -> Arc<dyn ResourceStorage> {
        self.storage.clone()
    }

    /// Run the control loop on its own task
    pub fn spawn(self: &Arc<Self>, events: mpsc::Receiver<DefinitionEvent>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(events))
    }

    /// Control loop: definition events and leadership changes, one at a time
    ///
    /// Keeps following leadership after the event channel closes; returns on
    /// [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>, events: mpsc::Receiver<DefinitionEvent>) {
        let mut events = Some(events);
        let mut leadership = Some(self.leader.leadership());
        let mut leading = self.leader.is_leader();
        let mut compaction = self.config.tombstone_compaction_interval().map(|every| {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        tracing::info!(leader = leading, "Synchro manager started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = next_tick(&mut compaction) => {
                    if self.leader.is_leader() {
                        if let Err(e) = self.compact_tombstones().await {
                            tracing::warn!(error = %e, "Tombstone compaction failed");
                        }
                    }
                }
                event = next_event(&mut events) => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        tracing::debug!("Definition channel closed");
                        events = None;
                    }
                },
                now_leading = next_leadership(&mut leadership) => match now_leading {
                    Some(now_leading) if now_leading != leading => {
                        leading = now_leading;
                        if leading {
                            self.on_elected().await;
                        } else {
                            self.on_deposed().await;
                        }
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!("Leader elector went away; keeping current leadership");
                        leadership = None;
                    }
                },
            }
        }

        tracing::info!("Synchro manager control loop stopped");
    }

    /// Reconcile one definition event
    pub async fn apply(&self, event: DefinitionEvent) {
        let _guard = self.reconcile.lock().await;
        match event {
            DefinitionEvent::Added(definition) | DefinitionEvent::Updated(definition) => {
                self.upsert(definition).await
            }
            DefinitionEvent::Removed(name) => self.remove(&name).await,
        }
    }

    async fn upsert(&self, definition: ClusterDefinition) {
        let name = definition.name.clone();
        self.definitions
            .write()
            .insert(name.clone(), definition.clone());

        if !self.leader.is_leader() {
            tracing::debug!(cluster = %name, "Not leading; recorded definition only");
            return;
        }
        self.ensure_running(definition).await;
    }

    /// Start a synchro for a definition unless an identical one already runs
    async fn ensure_running(&self, definition: ClusterDefinition) {
        let existing = self
            .synchros
            .get(&definition.name)
            .map(|entry| entry.value().clone());

        match existing {
            Some(synchro)
                if synchro.fingerprint() == definition.fingerprint()
                    && synchro.phase() != SynchroPhase::Stopped =>
            {
                self.readiness
                    .set_policy(&definition.name, &definition.readiness);
                tracing::debug!(cluster = %definition.name, "Definition unchanged for the synchro");
            }
            Some(synchro) => {
                if synchro.phase() != SynchroPhase::Stopped {
                    tracing::info!(cluster = %definition.name, "Definition changed; restarting synchro");
                }
                synchro.stop().await;
                self.launch(definition);
            }
            None => self.launch(definition),
        }
    }

    fn launch(&self, definition: ClusterDefinition) {
        let name = definition.name.clone();
        let synchro = Arc::new(ClusterSynchro::new(
            definition.clone(),
            self.storage.clone(),
            self.connector.clone(),
            self.config.clone(),
        ));
        self.readiness
            .track(&name, synchro.subscribe(), &definition.readiness);
        self.synchros.insert(name.clone(), synchro.clone());

        if synchro.phase() == SynchroPhase::Error {
            return;
        }

        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                if let Err(e) = synchro.start_with_permit(permit) {
                    tracing::warn!(cluster = %name, error = %e, "Cannot start synchro");
                }
            }
            Err(_) => {
                tracing::info!(
                    cluster = %name,
                    limit = self.config.max_concurrent_synchros,
                    "Synchro limit reached; queueing"
                );
                let permits = self.permits.clone();
                let cancel = synchro.cancellation();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        permit = permits.acquire_owned() => {
                            if let Ok(permit) = permit {
                                if let Err(e) = synchro.start_with_permit(permit) {
                                    tracing::debug!(cluster = %synchro.name(), error = %e, "Queued synchro not started");
                                }
                            }
                        }
                    }
                });
            }
        }
    }

    async fn remove(&self, name: &str) {
        let known = self.definitions.write().remove(name).is_some();
        let synchro = self.synchros.remove(name).map(|(_, s)| s);
        if !known && synchro.is_none() {
            tracing::debug!(cluster = %name, "Removal of unknown cluster ignored");
            return;
        }

        if let Some(synchro) = synchro {
            synchro.stop().await;
        }
        self.readiness.untrack(name);
        tracing::info!(cluster = %name, policy = ?self.config.removal_policy, "Cluster removed");

        if self.config.removal_policy == RemovalPolicy::Purge && self.leader.is_leader() {
            self.purge(name).await;
        }
    }

    /// Purge with retries while this replica still leads and is not
    /// shutting down
    async fn purge(&self, name: &str) {
        let mut backoff = Backoff::new(self.config.backoff);
        let stepped_down = stepped_down(&self.shutdown, self.leader.leadership());
        tokio::pin!(stepped_down);
        loop {
            if self.shutdown.is_cancelled() || !self.leader.is_leader() {
                tracing::warn!(cluster = %name, leader = self.leader.is_leader(), "Purge abandoned");
                return;
            }
            let attempt = tokio::select! {
                biased;
                _ = &mut stepped_down => {
                    tracing::warn!(cluster = %name, leader = self.leader.is_leader(), "Purge abandoned");
                    return;
                }
                attempt = tokio::time::timeout(
                    self.config.request_timeout(),
                    self.storage.purge_cluster(name),
                ) => attempt,
            };
            match attempt {
                Ok(Ok(purged)) => {
                    tracing::info!(cluster = %name, purged, "Purged records of removed cluster");
                    return;
                }
                Ok(Err(e)) if !e.is_retryable() && !e.is_storage_failure() => {
                    tracing::error!(cluster = %name, error = %e, "Cannot purge records of removed cluster");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(cluster = %name, error = %e, "Purge failed; retrying");
                }
                Err(_) => {
                    tracing::warn!(cluster = %name, "Purge timed out; retrying");
                }
            }

            if backoff.attempts() >= self.config.degraded_after {
                tracing::error!(cluster = %name, "Giving up purging records of removed cluster");
                return;
            }
            tokio::select! {
                biased;
                _ = &mut stepped_down => {
                    tracing::warn!(cluster = %name, leader = self.leader.is_leader(), "Purge abandoned");
                    return;
                }
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    /// Drop tombstones older than the configured retention
    ///
    /// Replayed events are never older than the retention, so compaction
    /// keeps deletes from being undone by late upserts.
    pub async fn compact_tombstones(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.tombstone_retention())
            .map_err(|e| SynchroError::Config(format!("tombstone retention: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let compacted = with_deadline(
            self.config.request_timeout(),
            self.storage.compact_tombstones(cutoff),
        )
        .await?;
        if compacted > 0 {
            tracing::info!(compacted, %cutoff, "Compacted tombstones");
        } else {
            tracing::debug!(%cutoff, "No tombstones to compact");
        }
        Ok(compacted)
    }

    async fn on_elected(&self) {
        let _guard = self.reconcile.lock().await;
        let definitions: Vec<ClusterDefinition> =
            self.definitions.read().values().cloned().collect();
        tracing::info!(clusters = definitions.len(), "Acquired leadership; starting synchros");
        for definition in definitions {
            self.ensure_running(definition).await;
        }
    }

    async fn on_deposed(&self) {
        let _guard = self.reconcile.lock().await;
        tracing::warn!("Lost leadership; stopping every synchro");
        self.stop_all().await;
    }

    async fn stop_all(&self) {
        let synchros: Vec<Arc<ClusterSynchro>> =
            self.synchros.iter().map(|e| e.value().clone()).collect();
        join_all(synchros.iter().map(|s| s.stop())).await;
    }

    /// Status snapshot of every synchro, keyed by cluster name
    pub fn statuses(&self) -> BTreeMap<String, SynchroStatus> {
        self.synchros
            .iter()
            .map(|e| (e.key().clone(), e.value().status()))
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<SynchroStatus> {
        self.synchros.get(name).map(|s| s.status())
    }

    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<SynchroStatus>> {
        self.synchros.get(name).map(|s| s.subscribe())
    }

    /// The latest definition recorded for a cluster
    pub fn definition(&self, name: &str) -> Option<ClusterDefinition> {
        self.definitions.read().get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ClusterDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    pub fn synchro(&self, name: &str) -> Option<Arc<ClusterSynchro>> {
        self.synchros.get(name).map(|s| s.value().clone())
    }

    /// Synchros currently holding a permit
    pub fn running(&self) -> usize {
        self.config.max_concurrent_synchros - self.permits.available_permits()
    }

    /// Stop the control loop and every synchro; stored data is kept
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _guard = self.reconcile.lock().await;
        tracing::info!(synchros = self.synchros.len(), "Shutting down synchro manager");
        self.stop_all().await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves on shutdown or once leadership is lost
async fn stepped_down(shutdown: &CancellationToken, mut leadership: watch::Receiver<bool>) {
    let deposed = async move {
        // An elector that went away leaves leadership as it was
        if leadership.wait_for(|leading| !*leading).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = deposed => {}
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<DefinitionEvent>>) -> Option<DefinitionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_leadership(leadership: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match leadership {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ScriptedConnector;
    use crate::storage::MemoryBackend;
    use crate::types::{ClusterConnection, GroupVersionResource, ResourceType};

    fn definition(name: &str) -> ClusterDefinition {
        ClusterDefinition::new(
            name,
            ClusterConnection::new("scripted://"),
            vec![ResourceType::new(
                GroupVersionResource::new("", "v1", "pods"),
                "Pod",
            )],
        )
    }

    fn manager(connector: Arc<ScriptedConnector>) -> SynchroManager {
        SynchroManager::new(
            Arc::new(MemoryBackend::default()),
            connector,
            SynchroConfig::default(),
            Arc::new(AlwaysLeader::new()),
        )
    }

    #[tokio::test]
    async fn test_update_restarts_only_on_fingerprint_change() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.add("a");
        let manager = manager(connector);

        manager.apply(DefinitionEvent::Added(definition("a"))).await;
        let first = manager.status("a").unwrap().run_id;

        let mut relaxed = definition("a");
        relaxed.readiness.grace_period_secs = Some(5);
        manager.apply(DefinitionEvent::Updated(relaxed.clone())).await;
        assert_eq!(manager.status("a").unwrap().run_id, first);
        assert_eq!(manager.definition("a"), Some(relaxed));

        let mut wider = definition("a");
        wider.worker_count = 4;
        manager.apply(DefinitionEvent::Updated(wider)).await;
        assert_ne!(manager.status("a").unwrap().run_id, first);

        manager.shutdown().await;
        assert_eq!(manager.status("a").unwrap().phase, SynchroPhase::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_definition_does_not_take_a_permit() {
        let manager = manager(Arc::new(ScriptedConnector::new()));
        let mut broken = definition("a");
        broken.worker_count = 0;
        manager.apply(DefinitionEvent::Added(broken)).await;

        assert_eq!(manager.status("a").unwrap().phase, SynchroPhase::Error);
        assert_eq!(manager.running(), 0);
        assert!(!manager.readiness().is_ready("a"));
    }

    #[tokio::test]
    async fn test_remove_unknown_is_ignored() {
        let manager = manager(Arc::new(ScriptedConnector::new()));
        manager.apply(DefinitionEvent::Removed("nope".into())).await;
        assert!(manager.statuses().is_empty());
    }

    #[test]
    fn test_event_name() {
        assert_eq!(DefinitionEvent::Removed("a".into()).name(), "a");
        assert_eq!(DefinitionEvent::Added(definition("b")).name(), "b");
    }
}
