//! Cluster synchro: keeps one member cluster mirrored into storage
//!
//! A synchro owns a supervisor task that connects to the cluster and runs one
//! list/watch worker per resource type. Its state is published through a
//! `watch` channel as [`SynchroStatus`] snapshots:
//!
//! ```text
//! Pending ──start──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!    │
//!    └── invalid definition ──▶ Error
//! ```
//!
//! Cluster outages never move a synchro to `Error`; they are retried with
//! backoff and surface as `last_error` on the status.

mod applier;
pub mod backoff;
mod resource;
pub mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterConnector};
use crate::codec::ResourceCodec;
use crate::config::SynchroConfig;
use crate::error::{Result, SynchroError};
use crate::storage::ResourceStorage;
use crate::types::{ClusterDefinition, SynchroPhase, SynchroStatus};

pub use backoff::Backoff;
pub use status::StatusHandle;

use resource::{run_resource, ResourceContext};

/// Await `fut`, failing with `Timeout` once `limit` passes
pub(crate) async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SynchroError::Timeout(limit))?
}

/// Synchronizer for one member cluster
pub struct ClusterSynchro {
    definition: Arc<ClusterDefinition>,
    storage: Arc<dyn ResourceStorage>,
    connector: Arc<dyn ClusterConnector>,
    config: SynchroConfig,
    status: StatusHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterSynchro {
    /// Create a synchro in `Pending`, or in `Error` when the definition is invalid
    pub fn new(
        definition: ClusterDefinition,
        storage: Arc<dyn ResourceStorage>,
        connector: Arc<dyn ClusterConnector>,
        config: SynchroConfig,
    ) -> Self {
        let mut initial = SynchroStatus::new(&definition.name, &definition.resources);
        if let Err(e) = definition.validate() {
            tracing::error!(cluster = %definition.name, error = %e, "Rejecting cluster definition");
            initial.phase = SynchroPhase::Error;
            initial.record_error(e.to_string());
        }

        Self {
            definition: Arc::new(definition),
            storage,
            connector,
            config,
            status: StatusHandle::new(initial),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ClusterDefinition {
        &self.definition
    }

    pub fn fingerprint(&self) -> String {
        self.definition.fingerprint()
    }

    pub fn status(&self) -> SynchroStatus {
        self.status.snapshot()
    }

    pub fn phase(&self) -> SynchroPhase {
        self.status.phase()
    }

    /// Receive every status change of this synchro
    pub fn subscribe(&self) -> watch::Receiver<SynchroStatus> {
        self.status.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start the supervisor task
    ///
    /// Starting twice is a no-op. Fails for synchros in `Error` and for
    /// synchros already stopped.
    pub fn start(&self) -> Result<()> {
        self.start_inner(None)
    }

    /// Start while holding a concurrency permit; the permit is released when
    /// the supervisor exits
    pub fn start_with_permit(&self, permit: OwnedSemaphorePermit) -> Result<()> {
        self.start_inner(Some(permit))
    }

    fn start_inner(&self, permit: Option<OwnedSemaphorePermit>) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        if self.status.phase() == SynchroPhase::Error {
            return Err(SynchroError::DefinitionInvalid(
                self.status
                    .snapshot()
                    .last_error
                    .unwrap_or_else(|| self.definition.name.clone()),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(SynchroError::Cancelled);
        }

        self.status.update(|s| {
            s.phase = SynchroPhase::Running;
            s.started_at = chrono::Utc::now();
        });
        tracing::info!(
            cluster = %self.definition.name,
            resources = self.definition.resources.len(),
            workers = self.definition.worker_count,
            "Starting cluster synchro"
        );

        let supervisor = Supervisor {
            definition: self.definition.clone(),
            storage: self.storage.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
            status: self.status.clone(),
            cancel: self.cancel.clone(),
        };
        *task = Some(tokio::spawn(async move {
            supervisor.run().await;
            drop(permit);
        }));
        Ok(())
    }

    /// Cancel the workers, drain queued events and wait for them
    ///
    /// Idempotent. A synchro that never started goes straight to `Stopped`;
    /// one in `Error` stays there.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();

        match task {
            Some(task) => {
                self.status.set_phase(SynchroPhase::Stopping);
                if let Err(e) = task.await {
                    tracing::error!(cluster = %self.definition.name, error = %e, "Synchro supervisor panicked");
                    self.status.update(|s| s.record_error(e.to_string()));
                }
                self.status.set_phase(SynchroPhase::Stopped);
                tracing::info!(cluster = %self.definition.name, "Cluster synchro stopped");
            }
            None => {
                if self.status.phase() != SynchroPhase::Error {
                    self.status.set_phase(SynchroPhase::Stopped);
                }
            }
        }
    }

    /// Token cancelled when the synchro stops
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ClusterSynchro {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    definition: Arc<ClusterDefinition>,
    storage: Arc<dyn ResourceStorage>,
    connector: Arc<dyn ClusterConnector>,
    config: SynchroConfig,
    status: StatusHandle,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let Some(client) = self.connect().await else {
            return;
        };

        let codec = Arc::new(ResourceCodec::for_resources(
            &self.definition.name,
            &self.definition.resources,
        ));
        let mut workers = JoinSet::new();
        for resource in &self.definition.resources {
            let ctx = Arc::new(ResourceContext::new(
                &self.definition.name,
                resource.clone(),
                client.clone(),
                self.storage.clone(),
                codec.clone(),
                self.config.clone(),
                self.status.clone(),
                self.definition.worker_count,
            ));
            workers.spawn(run_resource(ctx, self.cancel.child_token()));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(cluster = %self.definition.name, error = %e, "Resource worker panicked");
                self.status.update(|s| s.record_error(e.to_string()));
            }
        }
    }

    /// Connect with backoff until it works or the synchro is cancelled
    async fn connect(&self) -> Option<Arc<dyn ClusterClient>> {
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                attempt = with_deadline(
                    self.config.request_timeout(),
                    self.connector.connect(&self.definition),
                ) => attempt,
            };

            match attempt {
                Ok(client) => return Some(client),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        cluster = %self.definition.name,
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Cannot connect to cluster"
                    );
                    self.status.update(|s| s.record_error(e.to_string()));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
