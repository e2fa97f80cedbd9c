//! Storage contract and reference backends
//!
//! Synchros write and the query layer reads through [`ResourceStorage`];
//! a process binds one backend through [`init_storage_factory`].

pub mod backend;
pub mod filter;
pub mod memory_backend;
pub mod pagination;
pub mod registry;
pub mod version;
pub mod watch;

#[cfg(feature = "sqlite")]
mod connection;
#[cfg(feature = "sqlite")]
mod migrations;
#[cfg(feature = "sqlite")]
pub mod sqlite_backend;

pub use backend::{
    DeleteOutcome, HealthStatus, ListOptions, ListPage, ResourceStorage, SortField, SortOrder,
    StorageEvent, StorageEventType, StorageFactory, StorageStats, UpsertOutcome, WatchStream,
};
#[cfg(feature = "sqlite")]
pub use connection::Storage;
pub use filter::{Predicate, Requirement, SelectorOperator, SelectorScope};
pub use memory_backend::{MemoryBackend, MemoryStorageFactory};
pub use pagination::MAX_PAGE_SIZE;
pub use registry::{
    init_storage_factory, init_storage_factory_with, shutdown_storage_factory, storage_factory,
    FactoryConstructor, StorageRegistry,
};
#[cfg(feature = "sqlite")]
pub use sqlite_backend::{SqliteBackend, SqliteStorageFactory};
pub use version::VersionOrder;
