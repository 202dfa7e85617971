/*
    errors.rs - Error types for the data store

    Covers:
    - Expected outcomes callers branch on (not found, already exists)
    - Backend restrictions (unsupported operations)
    - Transport and transaction failures on the catalog backend
    - Storage faults inside the catalog service
*/

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::PoisonError;
use thiserror::Error;

/// Errors that can occur in data store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// No address reference under the given key
    #[error("address reference not found: {0}")]
    AddressRefNotFound(String),

    /// An address reference already exists under the given key
    #[error("address reference already exists: {0}")]
    AddressRefExists(String),

    #[error("chain metadata not found: {0}")]
    ChainMetadataNotFound(String),

    #[error("chain metadata already exists: {0}")]
    ChainMetadataExists(String),

    #[error("contract metadata not found: {0}")]
    ContractMetadataNotFound(String),

    #[error("contract metadata already exists: {0}")]
    ContractMetadataExists(String),

    /// Environment metadata has never been set
    #[error("environment metadata not set")]
    EnvMetadataNotSet,

    /// The backend refuses this operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Network or framing failure talking to the catalog
    #[error("transport error: {0}")]
    Transport(String),

    /// Begin/commit/rollback failed
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Row version kept moving under repeated retries
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation's context was cancelled or its deadline passed
    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A failure annotated with the step that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StoreError>,
    },
}

/// Result type for data store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Wrap this error with a step description
    pub fn context(self, context: impl Into<String>) -> Self {
        StoreError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for every kind-specific not-found outcome, including unset
    /// environment metadata
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            StoreError::AddressRefNotFound(_)
                | StoreError::ChainMetadataNotFound(_)
                | StoreError::ContractMetadataNotFound(_)
                | StoreError::EnvMetadataNotSet
        )
    }

    pub fn is_env_metadata_not_set(&self) -> bool {
        matches!(self.root(), StoreError::EnvMetadataNotSet)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.root(),
            StoreError::AddressRefExists(_)
                | StoreError::ChainMetadataExists(_)
                | StoreError::ContractMetadataExists(_)
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.root(), StoreError::UnsupportedOperation(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), StoreError::Cancelled)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), StoreError::Conflict(_))
    }
}

/// The record kind an operation targets, used to pick kind-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    AddressRef,
    ChainMetadata,
    ContractMetadata,
    EnvMetadata,
}

impl EntityKind {
    pub fn not_found(self, key: impl Display) -> StoreError {
        let key = key.to_string();
        match self {
            EntityKind::AddressRef => StoreError::AddressRefNotFound(key),
            EntityKind::ChainMetadata => StoreError::ChainMetadataNotFound(key),
            EntityKind::ContractMetadata => StoreError::ContractMetadataNotFound(key),
            EntityKind::EnvMetadata => StoreError::EnvMetadataNotSet,
        }
    }

    pub fn already_exists(self, key: impl Display) -> StoreError {
        let key = key.to_string();
        match self {
            EntityKind::AddressRef => StoreError::AddressRefExists(key),
            EntityKind::ChainMetadata => StoreError::ChainMetadataExists(key),
            EntityKind::ContractMetadata => StoreError::ContractMetadataExists(key),
            EntityKind::EnvMetadata => {
                StoreError::InvalidArgument("environment metadata is a singleton".to_string())
            }
        }
    }

    /// Human-readable collection name for messages
    pub fn describe(self) -> &'static str {
        match self {
            EntityKind::AddressRef => "address references",
            EntityKind::ChainMetadata => "chain metadata",
            EntityKind::ContractMetadata => "contract metadata",
            EntityKind::EnvMetadata => "environment metadata",
        }
    }
}

/// Attach step descriptions to fallible results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> StoreResult<T>;

    fn with_context<F, S>(self, f: F) -> StoreResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<StoreError>,
{
    fn context(self, context: impl Into<String>) -> StoreResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> StoreResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Storage(format!("connection pool: {}", err))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Internal(format!("blocking task failed: {}", err))
    }
}

/// Helper to convert lock poisoning into a storage error
pub(crate) fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Storage("Lock poisoned: a thread panicked while holding the lock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = StoreError::EnvMetadataNotSet
            .context("failed to get environment metadata from local store");

        assert!(err.is_env_metadata_not_set());
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "failed to get environment metadata from local store: environment metadata not set"
        );
    }

    #[test]
    fn test_nested_context() {
        let result: StoreResult<()> = Err(StoreError::AddressRefExists("1-A-1.0.0-".into()));
        let err = result
            .context("inner step")
            .with_context(|| format!("outer step {}", 2))
            .unwrap_err();

        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
        assert!(matches!(err.root(), StoreError::AddressRefExists(_)));
        assert!(err.to_string().starts_with("outer step 2: inner step:"));
    }

    #[test]
    fn test_kind_specific_errors() {
        assert!(matches!(
            EntityKind::ChainMetadata.not_found(1),
            StoreError::ChainMetadataNotFound(ref key) if key == "1"
        ));
        assert!(EntityKind::EnvMetadata.not_found("").is_env_metadata_not_set());
        assert!(EntityKind::ContractMetadata
            .already_exists("1-0xa")
            .is_already_exists());
    }

    #[test]
    fn test_context_on_foreign_errors() {
        let io: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let err = io.with_context(|| "read snapshot.json").unwrap_err();

        assert!(matches!(err.root(), StoreError::Storage(_)));
        assert_eq!(err.to_string(), "read snapshot.json: storage error: no such file");
    }

    #[test]
    fn test_unsupported_detection() {
        let err = StoreError::UnsupportedOperation("delete not supported".into());
        assert!(err.is_unsupported());
        assert!(!err.is_cancelled());
    }
}
