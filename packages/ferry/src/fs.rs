//! Filesystem operations over backup target environments.
//!
//! Staging helper binaries and key material has to work the same way whether
//! the target is the local machine, a docker container or a kubernetes pod.
//! [`Filesystem`] is the narrow capability the staging code programs against;
//! one concrete implementation exists per target environment.
//!
//! Paths are plain strings: for the remote implementations they name files
//! inside the target environment and have no meaning on the host.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

mod docker;
mod local;
mod pod;

pub use docker::DockerFilesystem;
pub use local::LocalFilesystem;
pub use pod::PodFilesystem;

/// Uniform file operations over a backup target environment.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Create `path` and all missing parents. Idempotent.
    async fn force_mkdir(&self, path: &str) -> Result<()>;

    /// Fetch `url` into `destination` inside the target environment.
    async fn download(&self, url: &str, destination: &str) -> Result<()>;

    /// Remove a file. A missing file is tolerated and logged at debug level.
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Create a symbolic link at `dst` pointing to `src`. The caller deletes
    /// any previous `dst` first.
    async fn link(&self, src: &str, dst: &str) -> Result<()>;

    /// Grant execute permission on `path`.
    async fn make_executable(&self, path: &str) -> Result<()>;

    /// Stream a file from the controller host to `remote_path` in the target
    /// environment.
    async fn copy_to(&self, local_path: &str, remote_path: &str) -> Result<()>;

    /// Create a gzipped tar at `archive_path` containing `files` rooted at
    /// `src_path`. An empty `files` list packs everything in `src_path`,
    /// hidden entries included.
    async fn pack(&self, archive_path: &str, src_path: &str, files: &[String]) -> Result<()>;

    /// Unpack a gzipped tar into `dst_path`.
    async fn unpack(&self, archive_path: &str, dst_path: &str) -> Result<()>;

    /// Whether a regular file exists at `path`.
    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// A unique scratch directory path. The directory is not created; that is
    /// the caller's responsibility.
    fn temp_dir_path(&self) -> String;

    /// Move or rename a file.
    async fn move_file(&self, src: &str, dst: &str) -> Result<()>;
}

/// Unique scratch path for this process. Uniqueness only has to hold within
/// the process since every transport session owns its own staging paths.
pub(crate) fn unique_temp_path() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "/tmp/backup-staging-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
