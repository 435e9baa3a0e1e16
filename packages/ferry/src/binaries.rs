//! Helper binary staging.
//!
//! Single-binary helpers perform the heavy lifting of a backup: querying
//! databases, streaming archives, tracing exits. They are downloaded once
//! into a local, versioned cache, then distributed to the target environment
//! where symbolic links give them stable `$PATH` names while versions
//! coexist side by side.

use tracing::{debug, info, instrument};

use crate::{
    error::Result,
    fs::Filesystem,
    settings::{
        BACKUP_MAKER_BIN_VERSION, GPG_PRIVATE_KEY_PATH, GPG_PUBLIC_KEY_PATH,
        TRACEXIT_BIN_VERSION, TRANSFER_ARCHIVE_PATH,
    },
};

/// A binary file downloadable from a URL, identified by `(url, filename,
/// version)`. The derived cache key `v{version}-{filename}` names its slot in
/// the versioned cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequiredBinary {
    url: String,
    filename: String,
    version: String,
    archive: bool,
}

impl RequiredBinary {
    /// A binary served directly at `url`. The filename is the URL basename
    /// and the version is unknown; `.tar.gz` URLs are treated as archives.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = url.rsplit('/').next().unwrap_or(&url).to_string();
        let archive = url.ends_with(".tar.gz");
        Self {
            url,
            filename,
            version: "unknown".to_string(),
            archive,
        }
    }

    /// A binary released on GitHub under
    /// `https://github.com/{project}/releases/download/{version}/{binary_name}`.
    pub fn github_release(project: &str, version: &str, binary_name: &str) -> Self {
        Self {
            url: format!(
                "https://github.com/{project}/releases/download/{version}/{binary_name}"
            ),
            filename: binary_name.to_string(),
            version: version.to_string(),
            archive: binary_name.ends_with(".tar.gz"),
        }
    }

    /// A binary released on GitHub as a tar.gz archive (e.g. by GoReleaser):
    /// the download is `archive_name`, the binary inside it is `binary_name`.
    pub fn github_release_archive(
        project: &str,
        version: &str,
        binary_name: &str,
        archive_name: &str,
    ) -> Self {
        Self {
            url: format!(
                "https://github.com/{project}/releases/download/{version}/{archive_name}"
            ),
            filename: binary_name.to_string(),
            version: version.to_string(),
            archive: true,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_archive(&self) -> bool {
        self.archive
    }

    /// Stable identity of this artifact in a versioned cache.
    pub fn cache_key(&self) -> String {
        format!("v{}-{}", self.version, self.filename)
    }
}

/// The helpers every backup needs, regardless of adapter.
pub fn default_backup_maker_binaries() -> Vec<RequiredBinary> {
    vec![
        RequiredBinary::github_release_archive(
            "riotkit-org/br-backup-maker",
            BACKUP_MAKER_BIN_VERSION,
            "br-backup-maker",
            &format!("br-backup-maker_{BACKUP_MAKER_BIN_VERSION}_linux_amd64.tar.gz"),
        ),
        RequiredBinary::github_release_archive(
            "riotkit-org/tracexit",
            TRACEXIT_BIN_VERSION,
            "tracexit",
            &format!("tracexit_{TRACEXIT_BIN_VERSION}_linux_amd64.tar.gz"),
        ),
    ]
}

/// Collect all binaries, versioned, into the local cache.
///
/// A binary already present under its cache key is never downloaded twice.
/// Archives are downloaded to a scratch directory, unpacked, and the inner
/// binary moved into its slot.
#[instrument(skip(fs, binaries))]
pub async fn download_required_tools(
    fs: &dyn Filesystem,
    bin_path: &str,
    versions_path: &str,
    binaries: &[RequiredBinary],
) -> Result<()> {
    debug!("preparing environment");
    if let Some(parent) = parent_dir(bin_path) {
        fs.force_mkdir(parent).await?;
    }
    fs.force_mkdir(bin_path).await?;
    fs.force_mkdir(versions_path).await?;

    for binary in binaries {
        let slot = format!("{versions_path}/{}", binary.cache_key());
        debug!(slot, "searching for tool");
        if fs.file_exists(&slot).await? {
            continue;
        }
        debug!(url = binary.url(), slot, "downloading tool");
        if binary.is_archive() {
            let scratch = fs.temp_dir_path();
            fs.force_mkdir(&scratch).await?;
            let archive = format!("{scratch}/archive.tar.gz");
            fs.download(binary.url(), &archive).await?;
            fs.unpack(&archive, &scratch).await?;
            fs.move_file(&format!("{scratch}/{}", binary.filename()), &slot)
                .await?;
            fs.make_executable(&slot).await?;
        } else {
            fs.download(binary.url(), &slot).await?;
            fs.make_executable(&slot).await?;
        }
    }
    Ok(())
}

/// Copy encryption keys from the controller to the target environment.
///
/// A key whose configured path is empty, or which does not exist on the
/// source, is silently skipped: a definition may legitimately configure only
/// one half of the pair.
#[instrument(skip(src_fs, dst_fs))]
pub async fn copy_encryption_keys(
    src_fs: &dyn Filesystem,
    dst_fs: &dyn Filesystem,
    public_key_path: &str,
    private_key_path: &str,
) -> Result<()> {
    info!("copying encryption keys");
    let keys = [
        (private_key_path, GPG_PRIVATE_KEY_PATH),
        (public_key_path, GPG_PUBLIC_KEY_PATH),
    ];
    for (source, target) in keys {
        if !source.is_empty() && src_fs.file_exists(source).await? {
            debug!(source, target, "copying key");
            dst_fs.copy_to(source, target).await?;
        }
    }
    Ok(())
}

/// Transfer the binaries missing at the target in one archive, then refresh
/// the stable symlinks.
///
/// Packing once and copying once amortises the network cost over all missing
/// binaries; the symlink per binary gives a stable `$PATH` entry while
/// versioned slots coexist.
#[instrument(skip(local_fs, dst_fs, binaries))]
pub async fn transfer_required_tools(
    local_fs: &dyn Filesystem,
    dst_fs: &dyn Filesystem,
    bin_path: &str,
    versions_path: &str,
    local_versions_path: &str,
    binaries: &[RequiredBinary],
) -> Result<()> {
    info!("copying required tools to the backup target environment");

    let mut missing = Vec::new();
    for binary in binaries {
        let slot = format!("{versions_path}/{}", binary.cache_key());
        if !dst_fs.file_exists(&slot).await? {
            missing.push(binary.cache_key());
        }
    }
    info!(?missing, "missing binaries will be copied to the target environment");

    if missing.is_empty() {
        info!("All binaries are up-to-date");
        return Ok(());
    }

    let scratch = local_fs.temp_dir_path();
    local_fs.force_mkdir(&scratch).await?;
    let archive = format!("{scratch}/backup-tools.tar.gz");
    local_fs.pack(&archive, local_versions_path, &missing).await?;

    debug!(versions_path, "unpacking at the target");
    dst_fs.copy_to(&archive, TRANSFER_ARCHIVE_PATH).await?;
    dst_fs.force_mkdir(bin_path).await?;
    dst_fs.force_mkdir(versions_path).await?;
    dst_fs.unpack(TRANSFER_ARCHIVE_PATH, versions_path).await?;
    local_fs.delete_file(&archive).await?;

    link_binaries(dst_fs, bin_path, versions_path, binaries).await
}

/// Point the stable name of every binary at its versioned slot, e.g.
/// `bin/tracexit -> bin/.versions/v1.0.0-tracexit`.
pub async fn link_binaries(
    fs: &dyn Filesystem,
    bin_path: &str,
    versions_path: &str,
    binaries: &[RequiredBinary],
) -> Result<()> {
    for binary in binaries {
        let target = format!("{bin_path}/{}", binary.filename());
        let slot = format!("{versions_path}/{}", binary.cache_key());
        debug!(slot, target, "linking version");
        fs.delete_file(&target).await?;
        fs.link(&slot, &target).await?;
        fs.make_executable(&slot).await?;
    }
    Ok(())
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) => None,
        Some((parent, _)) => Some(parent),
        None => None,
    }
}
