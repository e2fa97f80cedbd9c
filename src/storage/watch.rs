//! Change feed plumbing for storage watches
//!
//! Writers append every change to a bounded log under a backend revision and
//! broadcast it. A watch subscribes first, then replays the retained events
//! after its starting revision, emits a bookmark at the revision it caught up
//! to, and continues with live events, skipping anything it already replayed.

use std::collections::VecDeque;

use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::backend::{StorageEvent, StorageEventType, WatchStream};
use crate::error::{Result, SynchroError};
use crate::types::{GroupVersionResource, ResourceRecord};

/// Largest broadcast buffer, regardless of the retained window
const MAX_BROADCAST_CAPACITY: usize = 65_536;

pub(crate) fn broadcast_capacity(window: usize) -> usize {
    window.clamp(16, MAX_BROADCAST_CAPACITY)
}

/// Parse a watch starting point; `None` means "from the current revision"
pub fn parse_since(since: Option<&str>) -> Result<Option<u64>> {
    match since.map(str::trim) {
        None | Some("") | Some("0") => Ok(None),
        Some(raw) => raw.parse::<u64>().map(Some).map_err(|_| {
            SynchroError::RecordInvalid(format!("invalid storage revision '{}'", raw))
        }),
    }
}

/// Reject starting points outside the retained window
pub fn check_window(since: u64, first_retained: u64, latest: u64) -> Result<()> {
    if since > latest {
        return Err(SynchroError::RecordInvalid(format!(
            "storage revision {} is ahead of the latest revision {}",
            since, latest
        )));
    }
    // Every event after `since` must still be retained
    if since + 1 < first_retained {
        return Err(SynchroError::ResourceVersionTooOld(format!(
            "storage revision {} has been compacted (oldest retained is {})",
            since, first_retained
        )));
    }
    Ok(())
}

/// In-memory bounded change log
pub struct ChangeLog {
    window: usize,
    events: VecDeque<StorageEvent>,
    latest: u64,
    tx: broadcast::Sender<StorageEvent>,
}

impl ChangeLog {
    pub fn new(window: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity(window));
        Self {
            window: window.max(1),
            events: VecDeque::new(),
            latest: 0,
            tx,
        }
    }

    /// Record a change and publish it to live watchers
    pub fn append(
        &mut self,
        event_type: StorageEventType,
        cluster: &str,
        gvr: &GroupVersionResource,
        record: Option<ResourceRecord>,
    ) -> u64 {
        self.latest += 1;
        let event = StorageEvent {
            event_type,
            revision: self.latest,
            cluster: cluster.to_string(),
            gvr: gvr.clone(),
            record,
        };
        self.events.push_back(event.clone());
        while self.events.len() > self.window {
            self.events.pop_front();
        }
        // No receivers is fine
        let _ = self.tx.send(event);
        self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn first_retained(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.revision)
            .unwrap_or(self.latest + 1)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }

    /// Retained events of one scope after `since`
    pub fn replay(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: u64,
    ) -> Result<Vec<StorageEvent>> {
        check_window(since, self.first_retained(), self.latest)?;
        Ok(self
            .events
            .iter()
            .filter(|e| e.revision > since && e.cluster == cluster && &e.gvr == gvr)
            .cloned()
            .collect())
    }
}

struct WatchState {
    pending: VecDeque<StorageEvent>,
    rx: broadcast::Receiver<StorageEvent>,
    cluster: String,
    gvr: GroupVersionResource,
    last: u64,
    done: bool,
}

/// Build the stream for one watcher
///
/// `rx` must have been subscribed before `replayed` was read, and
/// `caught_up_to` is the latest revision at the time of that read.
pub fn watch_stream(
    replayed: Vec<StorageEvent>,
    rx: broadcast::Receiver<StorageEvent>,
    cluster: &str,
    gvr: &GroupVersionResource,
    caught_up_to: u64,
) -> WatchStream {
    let mut pending: VecDeque<StorageEvent> = replayed.into();
    pending.push_back(StorageEvent::bookmark(cluster, gvr, caught_up_to));

    let state = WatchState {
        pending,
        rx,
        cluster: cluster.to_string(),
        gvr: gvr.clone(),
        last: 0,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if let Some(event) = state.pending.pop_front() {
            state.last = state.last.max(event.revision);
            return Some((Ok(event), state));
        }
        loop {
            match state.rx.recv().await {
                Ok(event) => {
                    if event.revision <= state.last
                        || event.cluster != state.cluster
                        || event.gvr != state.gvr
                    {
                        continue;
                    }
                    state.last = event.revision;
                    return Some((Ok(event), state));
                }
                Err(RecvError::Lagged(missed)) => {
                    state.done = true;
                    let err = SynchroError::ResourceVersionTooOld(format!(
                        "watcher fell behind by {} events after revision {}",
                        missed, state.last
                    ));
                    return Some((Err(err), state));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn pods() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "pods")
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since(None).unwrap(), None);
        assert_eq!(parse_since(Some("0")).unwrap(), None);
        assert_eq!(parse_since(Some("17")).unwrap(), Some(17));
        assert!(parse_since(Some("abc")).is_err());
    }

    #[test]
    fn test_window_compaction() {
        let mut log = ChangeLog::new(3);
        for _ in 0..5 {
            log.append(StorageEventType::Added, "c", &pods(), None);
        }
        assert_eq!(log.latest(), 5);
        assert_eq!(log.first_retained(), 3);
        assert!(log.replay("c", &pods(), 2).is_ok());
        assert!(matches!(
            log.replay("c", &pods(), 1),
            Err(SynchroError::ResourceVersionTooOld(_))
        ));
        assert!(matches!(
            log.replay("c", &pods(), 9),
            Err(SynchroError::RecordInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_then_live_without_duplicates() {
        let mut log = ChangeLog::new(100);
        let nodes = GroupVersionResource::new("", "v1", "nodes");
        log.append(StorageEventType::Added, "c", &pods(), None);
        log.append(StorageEventType::Added, "c", &nodes, None);
        log.append(StorageEventType::Modified, "c", &pods(), None);

        let rx = log.subscribe();
        let replayed = log.replay("c", &pods(), 1).unwrap();
        let mut stream = watch_stream(replayed, rx, "c", &pods(), log.latest());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.revision, 3);
        let bookmark = stream.next().await.unwrap().unwrap();
        assert_eq!(bookmark.event_type, StorageEventType::Bookmark);
        assert_eq!(bookmark.revision, 3);

        log.append(StorageEventType::Added, "other", &pods(), None);
        log.append(StorageEventType::Deleted, "c", &pods(), None);
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.revision, 5);
        assert_eq!(live.event_type, StorageEventType::Deleted);
    }
}
