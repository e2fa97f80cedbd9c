//! Configuration consumed by the synchronization core
//!
//! All sections deserialize from TOML with defaults for every field, so an
//! empty file is a valid configuration:
//!
//! ```toml
//! [synchro]
//! max_concurrent_synchros = 32
//! removal_policy = "purge"
//!
//! [synchro.backoff]
//! initial_ms = 500
//! max_ms = 60000
//!
//! [storage]
//! backend = "sqlite"
//! db_path = "~/.local/share/clustersynchro/resources.db"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynchroError};
use crate::storage::VersionOrder;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub synchro: SynchroConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| SynchroError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.synchro.validate()?;
        self.storage.validate()
    }
}

/// What happens to stored records when a cluster definition is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Retain,
    Purge,
}

impl std::str::FromStr for RemovalPolicy {
    type Err = SynchroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(RemovalPolicy::Retain),
            "purge" => Ok(RemovalPolicy::Purge),
            other => Err(SynchroError::Config(format!(
                "unknown removal policy '{}', expected 'retain' or 'purge'",
                other
            ))),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Fraction of the delay randomized in both directions (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            multiplier: default_backoff_multiplier(),
            max_ms: default_backoff_max_ms(),
            jitter: default_backoff_jitter(),
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(SynchroError::Config(
                "backoff.initial_ms must be greater than zero".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(SynchroError::Config(
                "backoff.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.max_ms < self.initial_ms {
            return Err(SynchroError::Config(
                "backoff.max_ms must not be lower than backoff.initial_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SynchroError::Config(
                "backoff.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

/// Synchro and manager behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchroConfig {
    /// Ceiling on concurrently running cluster synchros
    #[serde(default = "default_max_concurrent_synchros")]
    pub max_concurrent_synchros: usize,
    /// Periodic full relist interval in seconds (0 = disabled)
    #[serde(default)]
    pub resync_interval_secs: u64,
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Capacity of the per resource type event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Deadline for opening a watch, for each list page and for each
    /// storage call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// A watch that yields nothing for this long is treated as broken
    #[serde(default = "default_watch_idle_timeout_ms")]
    pub watch_idle_timeout_ms: u64,
    /// How long a stopping synchro may spend draining queued events
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Consecutive storage failures before a resource type is marked degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Default time a resource type may stay in error before its cluster
    /// is reported unready
    #[serde(default = "default_readiness_grace_period_secs")]
    pub readiness_grace_period_secs: u64,
    /// Age after which tombstones are compacted away
    #[serde(default = "default_tombstone_retention_ms")]
    pub tombstone_retention_ms: u64,
    /// How often the leader compacts tombstones (0 = never)
    #[serde(default = "default_tombstone_compaction_interval_ms")]
    pub tombstone_compaction_interval_ms: u64,
}

impl Default for SynchroConfig {
    fn default() -> Self {
        Self {
            max_concurrent_synchros: default_max_concurrent_synchros(),
            resync_interval_secs: 0,
            removal_policy: RemovalPolicy::default(),
            backoff: BackoffConfig::default(),
            event_queue_capacity: default_event_queue_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            watch_idle_timeout_ms: default_watch_idle_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            degraded_after: default_degraded_after(),
            readiness_grace_period_secs: default_readiness_grace_period_secs(),
            tombstone_retention_ms: default_tombstone_retention_ms(),
            tombstone_compaction_interval_ms: default_tombstone_compaction_interval_ms(),
        }
    }
}

impl SynchroConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_idle_timeout_ms)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }

    pub fn tombstone_compaction_interval(&self) -> Option<Duration> {
        (self.tombstone_compaction_interval_ms > 0)
            .then(|| Duration::from_millis(self.tombstone_compaction_interval_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn readiness_grace_period(&self) -> Duration {
        Duration::from_secs(self.readiness_grace_period_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_synchros == 0 {
            return Err(SynchroError::Config(
                "max_concurrent_synchros must be greater than zero".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(SynchroError::Config(
                "event_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(SynchroError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.watch_idle_timeout_ms == 0 {
            return Err(SynchroError::Config(
                "watch_idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        // Replayed events can be as old as one watch session or one request
        if self.tombstone_retention_ms < self.watch_idle_timeout_ms.max(self.request_timeout_ms) {
            return Err(SynchroError::Config(
                "tombstone_retention_ms must cover watch_idle_timeout_ms and request_timeout_ms"
                    .to_string(),
            ));
        }
        if self.degraded_after == 0 {
            return Err(SynchroError::Config(
                "degraded_after must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

fn default_max_concurrent_synchros() -> usize {
    16
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Past the server-side watch timeout, so healthy idle watches end cleanly
fn default_watch_idle_timeout_ms() -> u64 {
    330_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_degraded_after() -> u32 {
    5
}

fn default_readiness_grace_period_secs() -> u64 {
    60
}

fn default_tombstone_retention_ms() -> u64 {
    3_600_000
}

fn default_tombstone_compaction_interval_ms() -> u64 {
    300_000
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered backend name ("memory", "sqlite")
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database path for file-backed backends
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Number of change events retained for resuming watches
    #[serde(default = "default_watch_window")]
    pub watch_window: usize,
    /// Resource version order used by backends that make it configurable
    #[serde(default)]
    pub version_order: VersionOrder,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: default_db_path(),
            watch_window: default_watch_window(),
            version_order: VersionOrder::default(),
        }
    }
}

impl StorageConfig {
    /// In-memory configuration, handy for tests
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            db_path: ":memory:".to_string(),
            ..Default::default()
        }
    }

    /// Database path with `~` expanded
    pub fn expanded_db_path(&self) -> String {
        shellexpand::tilde(&self.db_path).to_string()
    }

    fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(SynchroError::Config(
                "storage.backend cannot be empty".to_string(),
            ));
        }
        if self.watch_window == 0 {
            return Err(SynchroError::Config(
                "storage.watch_window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_db_path() -> String {
    "~/.local/share/clustersynchro/resources.db".to_string()
}

fn default_watch_window() -> usize {
    10_000
}
