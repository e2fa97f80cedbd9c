//! Error types for clustersynchro

use thiserror::Error;

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SynchroError>;

/// Main error type for the synchronization core
#[derive(Error, Debug)]
pub enum SynchroError {
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Resource version too old: {0}")]
    ResourceVersionTooOld(String),

    #[error("Unsupported resource kind: {0}")]
    UnsupportedResourceKind(String),

    #[error("Invalid record: {0}")]
    RecordInvalid(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid cluster definition: {0}")]
    DefinitionInvalid(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynchroError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SynchroError::ConnectionFailure(_)
                | SynchroError::StorageUnavailable(_)
                | SynchroError::Timeout(_)
                | SynchroError::Io(_)
        ) || self.is_database_busy()
    }

    #[cfg(feature = "sqlite")]
    fn is_database_busy(&self) -> bool {
        match self {
            SynchroError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    #[cfg(not(feature = "sqlite"))]
    fn is_database_busy(&self) -> bool {
        false
    }

    /// Short stable label, used in status reports and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SynchroError::ConnectionFailure(_) => "ConnectionFailure",
            SynchroError::ResourceVersionTooOld(_) => "ResourceVersionTooOld",
            SynchroError::UnsupportedResourceKind(_) => "UnsupportedResourceKind",
            SynchroError::RecordInvalid(_) => "RecordInvalid",
            SynchroError::StorageUnavailable(_) => "StorageUnavailable",
            SynchroError::DefinitionInvalid(_) => "DefinitionInvalid",
            SynchroError::Timeout(_) => "Timeout",
            SynchroError::Cancelled => "Cancelled",
            SynchroError::NotFound(_) => "NotFound",
            SynchroError::Config(_) => "Config",
            #[cfg(feature = "sqlite")]
            SynchroError::Database(_) => "Database",
            SynchroError::Serialization(_) => "Serialization",
            SynchroError::Io(_) => "Io",
            SynchroError::Internal(_) => "Internal",
        }
    }

    /// Whether the failure came from the storage side of a write
    pub fn is_storage_failure(&self) -> bool {
        match self {
            SynchroError::StorageUnavailable(_) => true,
            #[cfg(feature = "sqlite")]
            SynchroError::Database(_) => true,
            _ => false,
        }
    }
}
