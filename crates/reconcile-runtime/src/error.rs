//! Runtime error types.
//!
//! Store errors follow the taxonomy the reconcilers branch on: `NotFound`
//! drives the create path, `Conflict` and `Transient` are retried by the
//! work queue.

use thiserror::Error;

/// Errors returned by a typed [`ObjectStore`](crate::store::ObjectStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist in the authoritative store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stale resource version or the object already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network, timeout, or any other failure worth retrying
    #[error("Transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    /// True for `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for `Conflict`.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => {
                Self::NotFound(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 409 => {
                Self::Conflict(response.message.clone())
            }
            _ => Self::Transient(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Transient(format!("serialization failed: {error}"))
    }
}

/// Errors raised by the kind registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The kind was never registered at startup
    #[error("Kind {0} is not registered")]
    UnregisteredKind(String),

    /// The object has no name to reference it by
    #[error("{0} object has no name")]
    MissingName(String),
}

/// General runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A queue key could not be parsed
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Registry lookup failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store call failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Event publishing failed
    #[error("Event publishing failed: {0}")]
    Event(String),
}
