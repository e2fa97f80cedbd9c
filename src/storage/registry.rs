//! Backend registry and the process-wide storage handle
//!
//! Backends are looked up by name in an explicit registry, and the chosen
//! factory is bound once per process. Unlike a lazily initialized global, the
//! handle has a visible lifecycle: `init_storage_factory` at startup,
//! `shutdown_storage_factory` at exit.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::backend::StorageFactory;
use super::memory_backend::MemoryStorageFactory;
use crate::config::StorageConfig;
use crate::error::{Result, SynchroError};

/// Builds a factory from the storage configuration
pub type FactoryConstructor = fn(&StorageConfig) -> Result<Arc<dyn StorageFactory>>;

/// Name → constructor map of known backends
#[derive(Clone)]
pub struct StorageRegistry {
    constructors: BTreeMap<String, FactoryConstructor>,
}

fn memory_factory(config: &StorageConfig) -> Result<Arc<dyn StorageFactory>> {
    Ok(Arc::new(MemoryStorageFactory::new(config)))
}

#[cfg(feature = "sqlite")]
fn sqlite_factory(config: &StorageConfig) -> Result<Arc<dyn StorageFactory>> {
    Ok(Arc::new(super::sqlite_backend::SqliteStorageFactory::open(
        config,
    )?))
}

impl StorageRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the backends compiled into this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("memory", memory_factory);
        #[cfg(feature = "sqlite")]
        registry.register("sqlite", sqlite_factory);
        registry
    }

    /// Register (or replace) a backend
    pub fn register(&mut self, name: impl Into<String>, constructor: FactoryConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct the backend named by `config.backend`
    pub fn create(&self, config: &StorageConfig) -> Result<Arc<dyn StorageFactory>> {
        let constructor = self.constructors.get(&config.backend).ok_or_else(|| {
            SynchroError::Config(format!(
                "unknown storage backend '{}' (known: {})",
                config.backend,
                self.names().join(", ")
            ))
        })?;
        constructor(config)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

static STORAGE_FACTORY: Lazy<RwLock<Option<Arc<dyn StorageFactory>>>> =
    Lazy::new(|| RwLock::new(None));

/// Bind the process-wide storage factory using the built-in registry
pub fn init_storage_factory(config: &StorageConfig) -> Result<Arc<dyn StorageFactory>> {
    init_storage_factory_with(&StorageRegistry::with_builtins(), config)
}

/// Bind the process-wide storage factory from a custom registry
pub fn init_storage_factory_with(
    registry: &StorageRegistry,
    config: &StorageConfig,
) -> Result<Arc<dyn StorageFactory>> {
    let mut slot = STORAGE_FACTORY.write();
    if let Some(existing) = slot.as_ref() {
        return Err(SynchroError::Config(format!(
            "storage factory already initialized with backend '{}'",
            existing.name()
        )));
    }
    let factory = registry.create(config)?;
    tracing::info!(backend = factory.name(), "storage factory initialized");
    *slot = Some(factory.clone());
    Ok(factory)
}

/// The bound storage factory
pub fn storage_factory() -> Result<Arc<dyn StorageFactory>> {
    STORAGE_FACTORY.read().clone().ok_or_else(|| {
        SynchroError::Config("storage factory has not been initialized".to_string())
    })
}

/// Unbind and shut down the storage factory; a no-op when none is bound
pub async fn shutdown_storage_factory() -> Result<()> {
    let factory = STORAGE_FACTORY.write().take();
    match factory {
        Some(factory) => {
            factory.shutdown().await?;
            tracing::info!(backend = factory.name(), "storage factory shut down");
            Ok(())
        }
        None => Ok(()),
    }
}
