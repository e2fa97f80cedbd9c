//! Storage appliers for one resource type
//!
//! The watch reader hands events to `worker_count` appliers through bounded
//! queues. Events for one object always land on the same applier, so writes
//! to an identity stay in watch order while different objects are written in
//! parallel. A [`Watermark`] tracks which events are fully applied so the
//! cursor only ever covers a gap-free prefix of the watch.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::resource::{store_with_retry, ResourceContext};
use crate::cluster::WatchEvent;
use crate::error::{Result, SynchroError};
use crate::storage::{DeleteOutcome, UpsertOutcome};

/// Orders completions of events issued in watch order
///
/// `issue` hands out sequence numbers; `complete` returns the resource
/// version of the newest event whose whole prefix has completed, if that
/// prefix just grew.
#[derive(Default)]
pub(crate) struct Watermark {
    state: Mutex<WatermarkState>,
}

#[derive(Default)]
struct WatermarkState {
    next_seq: u64,
    /// Every sequence number below this has completed
    completed_through: u64,
    pending: BTreeMap<u64, Option<String>>,
}

impl Watermark {
    pub fn issue(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    pub fn complete(&self, seq: u64, resource_version: Option<String>) -> Option<String> {
        let mut state = self.state.lock();
        state.pending.insert(seq, resource_version);

        let mut advanced = None;
        loop {
            let next = state.completed_through;
            match state.pending.remove(&next) {
                Some(rv) => {
                    state.completed_through += 1;
                    if rv.is_some() {
                        advanced = rv;
                    }
                }
                None => break,
            }
        }
        advanced
    }
}

pub(crate) struct QueuedEvent {
    seq: u64,
    event: WatchEvent,
}

/// Applier workers plus the queues feeding them
pub(crate) struct ApplierPool {
    ctx: Arc<ResourceContext>,
    queues: Vec<Sender<QueuedEvent>>,
    workers: Vec<JoinHandle<()>>,
    watermark: Arc<Watermark>,
    /// Fired when draining gives up; in-flight retries stop
    abort: CancellationToken,
}

impl ApplierPool {
    pub fn spawn(ctx: Arc<ResourceContext>) -> Self {
        let worker_count = ctx.workers.max(1);
        let capacity = (ctx.config.event_queue_capacity / worker_count).max(1);
        let watermark = Arc::new(Watermark::default());
        let abort = CancellationToken::new();

        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = bounded(capacity);
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(
                ctx.clone(),
                rx,
                watermark.clone(),
                abort.clone(),
            )));
        }

        Self {
            ctx,
            queues,
            workers,
            watermark,
            abort,
        }
    }

    /// Queue one watch event, waiting while the target queue is full
    pub async fn dispatch(&self, event: WatchEvent) -> Result<()> {
        let seq = self.watermark.issue();
        if let WatchEvent::Bookmark(rv) = &event {
            let rv = (!rv.is_empty()).then(|| rv.clone());
            finish(&self.ctx, &self.watermark, seq, rv);
            return Ok(());
        }

        let shard = self.shard_for(&event);
        self.ctx.queue_grew();
        if self.queues[shard]
            .send(QueuedEvent { seq, event })
            .await
            .is_err()
        {
            self.ctx.queue_shrank();
            return Err(SynchroError::Cancelled);
        }
        Ok(())
    }

    fn shard_for(&self, event: &WatchEvent) -> usize {
        let object = match event {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
            WatchEvent::Bookmark(_) => return 0,
        };
        let metadata = object.get("metadata");
        let field = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
        };

        let mut hasher = DefaultHasher::new();
        field("namespace").hash(&mut hasher);
        field("name").hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    /// Stop accepting events and let the workers finish what is queued
    ///
    /// Events still queued when `limit` expires are abandoned; the cursor
    /// never covered them, so the next run re-reads them. A storage call in
    /// flight is never cut short: this returns only once every worker has
    /// exited, so no write of this pool lands after it.
    pub async fn drain(self, limit: Duration) {
        let ApplierPool {
            ctx,
            queues,
            workers,
            abort,
            ..
        } = self;

        for queue in &queues {
            queue.close();
        }
        let left = queues.iter().map(|q| q.len()).sum::<usize>();
        drop(queues);

        let joined = futures::future::join_all(workers);
        tokio::pin!(joined);
        let results = match tokio::time::timeout(limit, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    queued = left,
                    "Drain timed out; abandoning queued events"
                );
                abort.cancel();
                joined.await
            }
        };
        for result in results {
            if let Err(e) = result {
                tracing::error!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    error = %e,
                    "Applier worker panicked"
                );
            }
        }
        ctx.queue_cleared();
    }
}

fn finish(ctx: &ResourceContext, watermark: &Watermark, seq: u64, rv: Option<String>) {
    if let Some(rv) = watermark.complete(seq, rv) {
        ctx.advance_cursor(&rv);
    }
}

async fn run_worker(
    ctx: Arc<ResourceContext>,
    queue: Receiver<QueuedEvent>,
    watermark: Arc<Watermark>,
    abort: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            next = queue.recv() => match next {
                Ok(queued) => queued,
                // Closed and empty
                Err(_) => return,
            },
        };
        ctx.queue_shrank();

        let rv = queued.event.resource_version().map(str::to_string);
        match apply(&ctx, &queued.event, &abort).await {
            Ok(()) => {}
            Err(SynchroError::Cancelled) => return,
            Err(SynchroError::UnsupportedResourceKind(kind)) => {
                tracing::debug!(
                    cluster = %ctx.cluster,
                    kind = %kind,
                    "Skipping object of unsupported kind"
                );
            }
            Err(e) => {
                tracing::warn!(
                    cluster = %ctx.cluster,
                    resource = %ctx.resource.gvr,
                    event = queued.event.type_name(),
                    error = %e,
                    "Dropping watch event"
                );
                ctx.record_error(&e);
            }
        }

        finish(&ctx, &watermark, queued.seq, rv);
    }
}

async fn apply(ctx: &ResourceContext, event: &WatchEvent, abort: &CancellationToken) -> Result<()> {
    match event {
        WatchEvent::Added(object) | WatchEvent::Modified(object) => {
            let record = ctx.codec.encode(object)?;
            let outcome =
                store_with_retry(ctx, abort, || ctx.storage.upsert(record.clone())).await?;
            if outcome == UpsertOutcome::Created {
                ctx.adjust_object_count(1);
            }
        }
        WatchEvent::Deleted(object) => {
            let record = ctx.codec.encode_tombstone(object)?;
            let identity = record.identity();
            let outcome = store_with_retry(ctx, abort, || {
                ctx.storage
                    .delete(&identity, Some(&record.resource_version))
            })
            .await?;
            if outcome == DeleteOutcome::Deleted {
                ctx.adjust_object_count(-1);
            }
        }
        WatchEvent::Bookmark(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_waits_for_gaps() {
        let watermark = Watermark::default();
        let a = watermark.issue();
        let b = watermark.issue();
        let c = watermark.issue();

        assert_eq!(watermark.complete(c, Some("3".into())), None);
        assert_eq!(watermark.complete(a, Some("1".into())), Some("1".into()));
        assert_eq!(watermark.complete(b, Some("2".into())), Some("3".into()));
    }

    #[test]
    fn test_watermark_skips_versionless_events() {
        let watermark = Watermark::default();
        let a = watermark.issue();
        let b = watermark.issue();
        assert_eq!(watermark.complete(a, Some("7".into())), Some("7".into()));
        assert_eq!(watermark.complete(b, None), None);
    }
}
