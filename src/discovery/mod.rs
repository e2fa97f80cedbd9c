//! Cluster definition discovery
//!
//! Turns successive snapshots of the desired cluster set into
//! [`DefinitionEvent`]s for the manager. [`FileDefinitionSource`] polls a TOML
//! or JSON file; any other source only needs to produce snapshots and call
//! [`diff`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SynchroError};
use crate::manager::DefinitionEvent;
use crate::types::ClusterDefinition;

/// Desired cluster set keyed by name
pub type DefinitionSnapshot = BTreeMap<String, ClusterDefinition>;

/// Events that take `previous` to `next`
///
/// Removals come first so that a replaced cluster frees its slot before
/// additions are started.
pub fn diff(previous: &DefinitionSnapshot, next: &DefinitionSnapshot) -> Vec<DefinitionEvent> {
    let mut events: Vec<DefinitionEvent> = previous
        .keys()
        .filter(|name| !next.contains_key(*name))
        .map(|name| DefinitionEvent::Removed(name.clone()))
        .collect();

    for (name, definition) in next {
        match previous.get(name) {
            None => events.push(DefinitionEvent::Added(definition.clone())),
            Some(old) if old != definition => {
                events.push(DefinitionEvent::Updated(definition.clone()))
            }
            Some(_) => {}
        }
    }
    events
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    clusters: Vec<ClusterDefinition>,
}

/// Parse a definitions document; the format follows the file extension
/// (`.json`, anything else is TOML)
pub fn parse_definitions(content: &str, json: bool) -> Result<DefinitionSnapshot> {
    let file: DefinitionFile = if json {
        serde_json::from_str(content)?
    } else {
        toml::from_str(content)
            .map_err(|e| SynchroError::Config(format!("invalid definitions file: {}", e)))?
    };

    let mut snapshot = DefinitionSnapshot::new();
    for definition in file.clusters {
        let name = definition.name.clone();
        if snapshot.insert(name.clone(), definition).is_some() {
            return Err(SynchroError::Config(format!(
                "cluster '{}' is defined more than once",
                name
            )));
        }
    }
    Ok(snapshot)
}

pub fn load_definitions(path: impl AsRef<Path>) -> Result<DefinitionSnapshot> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    parse_definitions(&content, json)
}

/// Polls a definitions file and emits the differences
pub struct FileDefinitionSource {
    path: PathBuf,
    interval: Duration,
    known: DefinitionSnapshot,
}

impl FileDefinitionSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            known: DefinitionSnapshot::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file and return what changed since the last poll
    ///
    /// On error the previous snapshot is kept.
    pub fn poll(&mut self) -> Result<Vec<DefinitionEvent>> {
        let next = load_definitions(&self.path)?;
        let events = diff(&self.known, &next);
        self.known = next;
        Ok(events)
    }

    /// Poll until cancelled or the receiver goes away
    pub async fn run(mut self, events: mpsc::Sender<DefinitionEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let changes = match self.poll() {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Cannot load cluster definitions");
                    continue;
                }
            };
            if !changes.is_empty() {
                tracing::info!(path = %self.path.display(), changes = changes.len(), "Cluster definitions changed");
            }
            for change in changes {
                if events.send(change).await.is_err() {
                    tracing::debug!("Definition receiver closed; stopping file poller");
                    return;
                }
            }
        }
    }
}
