//! `ferry`: transport core for a backup-orchestration tool.
//!
//! A *transport* runs a backup or restore command inside a target execution
//! environment: the local shell, a running docker container, a temporary
//! docker container sharing an application's volumes, a running kubernetes
//! pod, or a temporary kubernetes sidecar pod inheriting the original pod's
//! volumes. For each environment the transport stages the required helper
//! binaries and encryption keys, launches the backup process, streams its
//! output and guarantees cleanup, including scaling workload controllers
//! back up if it scaled them down.

pub mod binaries;
pub mod cluster;
pub mod command;
pub mod definition;
pub mod docker;
pub mod error;
pub mod exec;
pub mod fs;
pub mod settings;
pub mod transport;

pub use binaries::{RequiredBinary, default_backup_maker_binaries};
pub use command::Operation;
pub use definition::BackupDefinition;
pub use error::{Result, TransportError};
pub use transport::{
    DockerExecTransport, DockerSidecarTransport, PodExecTransport, ScopedSession, ShellTransport,
    SidecarPodTransport, Transport,
};
