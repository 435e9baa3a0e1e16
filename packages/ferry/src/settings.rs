//! Well-known paths, versions and wire constants shared by the transports.

use std::path::PathBuf;

use crate::error::{Result, TransportError};

/// Version of the `br-backup-maker` helper staged into target environments.
pub const BACKUP_MAKER_BIN_VERSION: &str = "0.0.4";

/// Version of the `tracexit` helper staged into target environments.
pub const TRACEXIT_BIN_VERSION: &str = "1.0.0";

/// Name of the backup process binary invoked in the target environment.
pub const BACKUP_MAKER_BINARY: &str = "br-backup-maker";

/// Directory in the target environment holding stable symlinks to versioned
/// binaries. Meant to be prepended to `$PATH` by assembled commands.
pub const TARGET_ENV_BIN_PATH: &str = "/opt/backup-tools/bin";

/// Directory in the target environment holding versioned binaries, pointed at
/// by the symlinks under [`TARGET_ENV_BIN_PATH`].
pub const TARGET_ENV_VERSIONS_PATH: &str = "/opt/backup-tools/bin/.versions";

/// Scratch path the staging archive is copied to before unpacking.
pub const TRANSFER_ARCHIVE_PATH: &str = "/tmp/.backup-tools.tar.gz";

/// Where the public encryption key lands in the target environment.
pub const GPG_PUBLIC_KEY_PATH: &str = "/tmp/.gpg.pub";

/// Where the private encryption key lands in the target environment.
pub const GPG_PRIVATE_KEY_PATH: &str = "/tmp/.gpg.key";

/// Trailer appended to wrapped remote commands. Kubernetes exec channels do
/// not reliably report exit codes, so a wrapped command only counts as
/// successful when this marker shows up in its captured stdout.
pub const EXIT_SENTINEL: &str = "@<br-exit-ok>";

/// Label attached to temporary sidecar pods, pointing back at the pod the
/// backup was taken for.
pub const ORIGINAL_POD_LABEL: &str = "riotkit.org/original-pod";

/// Local cache directory holding symlinks to downloaded helper binaries.
pub fn local_bin_path() -> Result<PathBuf> {
    Ok(local_cache_root()?.join("bin"))
}

/// Local cache directory holding the versioned helper binaries themselves.
pub fn local_versions_path() -> Result<PathBuf> {
    Ok(local_cache_root()?.join("bin").join(".versions"))
}

fn local_cache_root() -> Result<PathBuf> {
    let home = homedir::my_home()
        .map_err(|err| TransportError::filesystem("resolve home directory", "~", err))?
        .ok_or_else(|| TransportError::configuration("current user has no home directory"))?;
    Ok(home.join(".cache").join("ferry"))
}
