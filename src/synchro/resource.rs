//! List/watch loop for one resource type of one cluster
//!
//! The reader lists the type, prunes what disappeared, then follows the watch
//! from the cursor. Watch events go to the [`ApplierPool`]; the cursor moves
//! only as the pool completes them. A closed watch resumes from the cursor,
//! an expired one relists.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::applier::ApplierPool;
use super::backoff::Backoff;
use super::status::StatusHandle;
use super::with_deadline;
use crate::cluster::ClusterClient;
use crate::codec::ResourceCodec;
use crate::config::SynchroConfig;
use crate::error::{Result, SynchroError};
use crate::storage::{ListOptions, ResourceStorage, MAX_PAGE_SIZE};
use crate::types::{ResourceIdentity, ResourceSyncState, ResourceType};

/// Everything the reader and appliers of one resource type share
pub(crate) struct ResourceContext {
    pub cluster: String,
    pub resource: ResourceType,
    pub client: Arc<dyn ClusterClient>,
    pub storage: Arc<dyn ResourceStorage>,
    pub codec: Arc<ResourceCodec>,
    pub config: SynchroConfig,
    pub status: StatusHandle,
    pub workers: usize,
    storage_failures: AtomicU32,
    queued: AtomicUsize,
}

impl ResourceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: impl Into<String>,
        resource: ResourceType,
        client: Arc<dyn ClusterClient>,
        storage: Arc<dyn ResourceStorage>,
        codec: Arc<ResourceCodec>,
        config: SynchroConfig,
        status: StatusHandle,
        workers: usize,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            resource,
            client,
            storage,
            codec,
            config,
            status,
            workers,
            storage_failures: AtomicU32::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn cursor(&self) -> Option<String> {
        self.status
            .resource(&self.resource.gvr)
            .and_then(|r| r.cursor.resource_version)
    }

    /// Move the cursor forward; older versions are ignored
    pub fn advance_cursor(&self, resource_version: &str) {
        let order = self.storage.version_order();
        self.status.update_resource(&self.resource.gvr, |r| {
            let newer = match &r.cursor.resource_version {
                Some(current) => order.is_newer(resource_version, current),
                None => true,
            };
            if newer {
                r.cursor.advance(resource_version);
            }
        });
    }

    fn mark_listed(&self, resource_version: &str, object_count: u64) {
        self.status.update_resource(&self.resource.gvr, |r| {
            r.cursor.advance(resource_version);
            r.cursor.listed = true;
            r.object_count = object_count;
            r.state = ResourceSyncState::Watching;
            r.record_success();
        });
    }

    pub fn set_state(&self, state: ResourceSyncState) {
        self.status
            .update_resource(&self.resource.gvr, |r| r.state = state);
    }

    pub fn record_error(&self, error: &SynchroError) {
        let key = self.resource.gvr.to_string();
        self.status.update(|status| {
            status.record_error(format!("{}: {}", key, error));
            if let Some(resource) = status.resources.get_mut(&key) {
                resource.record_error(error.to_string());
            }
        });
    }

    pub fn record_success(&self) {
        self.status
            .update_resource(&self.resource.gvr, |r| r.record_success());
    }

    pub fn adjust_object_count(&self, delta: i64) {
        self.status.update_resource(&self.resource.gvr, |r| {
            r.object_count = r.object_count.saturating_add_signed(delta);
        });
    }

    pub fn queue_grew(&self) {
        let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish_queue_depth(depth);
    }

    pub fn queue_shrank(&self) {
        let previous = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        self.publish_queue_depth(previous.saturating_sub(1));
    }

    pub fn queue_cleared(&self) {
        self.queued.store(0, Ordering::SeqCst);
        self.publish_queue_depth(0);
    }

    fn publish_queue_depth(&self, depth: usize) {
        self.status
            .update_resource(&self.resource.gvr, |r| r.queue_depth = depth);
    }

    fn note_storage_failure(&self, error: &SynchroError) {
        let failures = self.storage_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.record_error(error);
        if failures == self.config.degraded_after {
            tracing::warn!(
                cluster = %self.cluster,
                resource = %self.resource.gvr,
                failures,
                "Storage writes keep failing; marking resource type degraded"
            );
            self.status
                .update_resource(&self.resource.gvr, |r| r.degraded = true);
        }
    }

    fn note_storage_success(&self) {
        if self.storage_failures.swap(0, Ordering::SeqCst) > 0 {
            self.status.update_resource(&self.resource.gvr, |r| {
                r.degraded = false;
                r.record_success();
            });
        }
    }
}

/// Run a storage call until it succeeds, fails for good, or `cancel` fires
///
/// Retryable and storage-side failures back off and count toward the
/// degraded threshold; anything else is returned to the caller. `cancel` is
/// checked between attempts only; an attempt that has started runs until it
/// returns or hits the request deadline.
pub(crate) async fn store_with_retry<T, F, Fut>(
    ctx: &ResourceContext,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(ctx.config.backoff);
    loop {
        if cancel.is_cancelled() {
            return Err(SynchroError::Cancelled);
        }
        match with_deadline(ctx.config.request_timeout(), op()).await {
            Ok(value) => {
                ctx.note_storage_success();
                return Ok(value);
            }
            Err(e) if e.is_retryable() || e.is_storage_failure() => {
                ctx.note_storage_failure(&e);
                let delay = backoff.next_delay();
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Storage call failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SynchroError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

enum SessionEnd {
    Cancelled,
    /// Server closed the watch; resume from the cursor
    Closed { received: usize },
    /// Cursor no longer usable; relist
    Expired,
    ResyncDue,
    Failed(SynchroError),
}

/// Drive one resource type until `cancel` fires, then drain its appliers
pub(crate) async fn run_resource(ctx: Arc<ResourceContext>, cancel: CancellationToken) {
    let pool = ApplierPool::spawn(ctx.clone());
    let mut backoff = Backoff::new(ctx.config.backoff);
    let mut need_list = true;
    let mut resync_at = None;

    tracing::debug!(cluster = %ctx.cluster, resource = %ctx.resource.gvr, "Resource worker started");

    while !cancel.is_cancelled() {
        if need_list {
            match relist(&ctx, &cancel).await {
                Ok(()) => {
                    need_list = false;
                    backoff.reset();
                    resync_at = ctx.config.resync_interval().map(|every| Instant::now() + every);
                }
                Err(SynchroError::Cancelled) => break,
                Err(e) => {
                    tracing::warn!(
                        cluster = %ctx.cluster,
                        resource = %ctx.resource.gvr,
                        error = %e,
                        "List failed"
                    );
                    ctx.record_error(&e);
                    if !wait_backoff(&ctx, &mut backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            }
        }

        let Some(cursor) = ctx.cursor() else {
            need_list = true;
            continue;
        };

        ctx.set_state(ResourceSyncState::Watching);
        match watch_session(&ctx, &pool, &cancel, &cursor, resync_at).await {
            SessionEnd::Cancelled => break,
            SessionEnd::Closed { received } => {
                tracing::debug!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    received,
                    "Watch closed; resuming"
                );
                if received > 0 {
                    backoff.reset();
                } else if !wait_backoff(&ctx, &mut backoff, &cancel).await {
                    break;
                }
            }
            SessionEnd::Expired => {
                tracing::info!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    cursor = %cursor,
                    "Watch cursor expired; relisting"
                );
                need_list = true;
            }
            SessionEnd::ResyncDue => need_list = true,
            SessionEnd::Failed(e) => {
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    error = %e,
                    "Watch failed"
                );
                ctx.record_error(&e);
                if !wait_backoff(&ctx, &mut backoff, &cancel).await {
                    break;
                }
            }
        }
    }

    pool.drain(ctx.config.drain_timeout()).await;
    tracing::debug!(cluster = %ctx.cluster, resource = %ctx.resource.gvr, "Resource worker stopped");
}

/// Sleep out the next backoff delay; false when cancelled meanwhile
async fn wait_backoff(
    ctx: &ResourceContext,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> bool {
    ctx.set_state(ResourceSyncState::Backoff);
    let delay = backoff.next_delay();
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

/// Full list, store, prune, then reset the cursor to the list version
async fn relist(ctx: &ResourceContext, cancel: &CancellationToken) -> Result<()> {
    let resyncing = ctx
        .status
        .resource(&ctx.resource.gvr)
        .map(|r| r.cursor.listed)
        .unwrap_or(false);
    ctx.set_state(if resyncing {
        ResourceSyncState::Resyncing
    } else {
        ResourceSyncState::Listing
    });

    // Clients bound each page request themselves; a large list may take
    // many request timeouts in total
    let list = tokio::select! {
        _ = cancel.cancelled() => return Err(SynchroError::Cancelled),
        list = ctx.client.list(&ctx.resource) => list?,
    };

    let mut records = Vec::with_capacity(list.items.len());
    for object in &list.items {
        match ctx.codec.encode(object) {
            Ok(record) => records.push(record),
            Err(SynchroError::UnsupportedResourceKind(kind)) => {
                tracing::debug!(cluster = %ctx.cluster, kind = %kind, "Skipping listed object of unsupported kind");
            }
            Err(e) => {
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    error = %e,
                    "Dropping invalid listed object"
                );
                ctx.record_error(&e);
            }
        }
    }

    let seen: HashSet<ResourceIdentity> = records.iter().map(|r| r.identity()).collect();
    let mut writes = stream::iter(records.into_iter().map(|record| {
        store_with_retry(ctx, cancel, move || ctx.storage.upsert(record.clone()))
    }))
    .buffer_unordered(ctx.workers.max(1));

    // In-flight writes finish even when cancelled
    let mut cancelled = false;
    while let Some(result) = writes.next().await {
        match result {
            Ok(_) => {}
            Err(SynchroError::Cancelled) => cancelled = true,
            Err(e) => {
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    error = %e,
                    "Dropping listed object the store rejected"
                );
                ctx.record_error(&e);
            }
        }
    }
    drop(writes);
    if cancelled {
        return Err(SynchroError::Cancelled);
    }

    let pruned = prune(ctx, &seen, &list.resource_version, cancel).await?;
    ctx.mark_listed(&list.resource_version, seen.len() as u64);

    tracing::info!(
        cluster = %ctx.cluster,
        resource = %ctx.resource.gvr,
        objects = seen.len(),
        pruned,
        resource_version = %list.resource_version,
        "Listed resource type"
    );
    Ok(())
}

/// Delete stored records the latest list no longer contains
///
/// Deletes carry the list's resource version, so a record written by a newer
/// watch event in the meantime is left alone.
async fn prune(
    ctx: &ResourceContext,
    seen: &HashSet<ResourceIdentity>,
    list_version: &str,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut stale = Vec::new();
    let mut options = ListOptions {
        limit: Some(MAX_PAGE_SIZE),
        ..Default::default()
    };
    loop {
        let page = store_with_retry(ctx, cancel, || {
            ctx.storage
                .list(&ctx.cluster, &ctx.resource.gvr, &options)
        })
        .await?;
        stale.extend(
            page.items
                .into_iter()
                .map(|r| r.identity())
                .filter(|id| !seen.contains(id)),
        );
        match page.continue_token {
            Some(token) => options.continue_token = Some(token),
            None => break,
        }
    }

    let mut pruned = 0;
    for identity in stale {
        let outcome = store_with_retry(ctx, cancel, || {
            ctx.storage.delete(&identity, Some(list_version))
        })
        .await?;
        if outcome == crate::storage::DeleteOutcome::Deleted {
            tracing::debug!(cluster = %ctx.cluster, identity = %identity, "Pruned record missing from list");
            pruned += 1;
        }
    }
    Ok(pruned)
}

async fn watch_session(
    ctx: &ResourceContext,
    pool: &ApplierPool,
    cancel: &CancellationToken,
    cursor: &str,
    resync_at: Option<Instant>,
) -> SessionEnd {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        opened = with_deadline(
            ctx.config.request_timeout(),
            ctx.client.watch(&ctx.resource, cursor),
        ) => opened,
    };
    let mut events = match opened {
        Ok(events) => events,
        Err(SynchroError::ResourceVersionTooOld(_)) => return SessionEnd::Expired,
        Err(e) => return SessionEnd::Failed(e),
    };
    ctx.record_success();
    tracing::debug!(cluster = %ctx.cluster, resource = %ctx.resource.gvr, cursor, "Watch opened");

    let resync = async move {
        match resync_at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(resync);

    let idle = ctx.config.watch_idle_timeout();
    let mut received = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = &mut resync => return SessionEnd::ResyncDue,
            next = timeout(idle, events.next()) => match next {
                // Half-open connection; resume from the cursor
                Err(_) => return SessionEnd::Failed(SynchroError::Timeout(idle)),
                Ok(next) => match next {
                    None => return SessionEnd::Closed { received },
                    Some(Err(SynchroError::ResourceVersionTooOld(_))) => {
                        return SessionEnd::Expired
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    Some(Ok(event)) => {
                        received += 1;
                        let queued = tokio::select! {
                            _ = cancel.cancelled() => return SessionEnd::Cancelled,
                            queued = pool.dispatch(event) => queued,
                        };
                        if queued.is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                },
            },
        }
    }
}
