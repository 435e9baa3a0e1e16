//! Failure categories raised by the transport core.
//!
//! Transports and the filesystem layer return [`TransportError`] so that
//! callers can distinguish a misconfigured spec from a missing container from
//! a backup process that genuinely failed. Variants carry the context needed
//! to print an actionable message without any further lookups.

use thiserror::Error;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport specification is missing required fields or carries
    /// values of the wrong shape. Raised during transport construction.
    #[error("invalid transport specification: {0}")]
    Configuration(String),

    #[error("container \"{container}\" is not created")]
    ContainerNotFound { container: String },

    #[error("container \"{container}\" is not running but actually {status}")]
    ContainerNotRunning { container: String, status: String },

    #[error("no pods found matching selector {selector} in {namespace} namespace")]
    PodNotFound { selector: String, namespace: String },

    #[error("timed out while waiting for pod '{pod}' in namespace '{namespace}'")]
    PodReadinessTimeout { pod: String, namespace: String },

    #[error(
        "pod '{pod}' already exists or is terminating, please wait a moment \
         - cannot start process in parallel, it may break something"
    )]
    PodCreationConflict { pod: String },

    #[error(
        "cannot achieve desired state of '{replicas}' replicas \
         for '{name}' in '{namespace}' namespace"
    )]
    CannotScale {
        name: String,
        namespace: String,
        replicas: i32,
    },

    /// A command executed in a remote environment exited with a failure, or
    /// finished without emitting the success sentinel. Carries the full
    /// captured output.
    #[error("remote command failed: {output}")]
    Exec { output: String },

    #[error("buffering of stream \"{stream}\" ended earlier with error")]
    Buffering { stream: String },

    #[error("backup process reported a failure: {0}")]
    BackupProcess(String),

    #[error("restore process reported a failure: {0}")]
    BackupRestore(String),

    /// A filesystem operation failed; names the operation and the path it
    /// was applied to.
    #[error("{operation} failed for '{path}'")]
    Filesystem {
        operation: &'static str,
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Wrap an arbitrary error as a failed filesystem operation on `path`.
    pub fn filesystem(
        operation: &'static str,
        path: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Filesystem {
            operation,
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
