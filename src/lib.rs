//! Clustersynchro - multi-cluster resource synchronization
//!
//! Mirrors resources from many member clusters into one store that serves
//! list/get/watch over the aggregated view. Each cluster gets a synchro that
//! lists and watches its resource types and reconciles them into a
//! [`storage::ResourceStorage`] backend; the [`manager::SynchroManager`]
//! supervises the fleet and the [`readiness::ReadinessTracker`] reports
//! which clusters are safe to serve from.

pub mod cluster;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod readiness;
pub mod storage;
pub mod synchro;
pub mod types;

pub use config::{Config, RemovalPolicy, StorageConfig, SynchroConfig};
pub use error::{Result, SynchroError};
pub use manager::{DefinitionEvent, SynchroManager};
pub use synchro::ClusterSynchro;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
