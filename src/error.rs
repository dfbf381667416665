//! Error types for the KubeOps reconciliation core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    /// Watch stream error
    #[error("Watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or unreadable operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The entity lock provider was closed; no new acquisitions are possible
    #[error("Entity lock provider is closed")]
    LockProviderClosed,

    /// A user reconcile callback failed
    #[error("Reconcile failed: {0}")]
    ReconcileError(String),

    /// A registered finalizer failed
    #[error("Finalizer {name} failed: {message}")]
    FinalizerError { name: String, message: String },

    /// A watched object is missing part of its identity (name or uid)
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Build a reconcile error from anything printable
    pub fn reconcile(message: impl std::fmt::Display) -> Self {
        Error::ReconcileError(message.to_string())
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::WatchError(_) => "watch",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::IoError(_) => "io",
            Error::LockProviderClosed => "lock_closed",
            Error::ReconcileError(_) => "reconcile",
            Error::FinalizerError { .. } => "finalizer",
            Error::MissingObjectKey(_) => "missing_key",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
