//! Controller-specific error types.
//!
//! This module defines error types specific to the Foo controller that are
//! not covered by upstream library errors.

use kube::Error as KubeError;
use kube::config::InferConfigError;
use reconcile_runtime::{RegistryError, RuntimeError, StoreError};
use thiserror::Error;

/// Errors that can occur in the Foo controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Kubeconfig could not be loaded
    #[error("Error building kubeconfig: {0}")]
    Kubeconfig(#[from] InferConfigError),

    /// Store call failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Kind lookup failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Runtime setup failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A pass could not be carried out
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe/metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}
