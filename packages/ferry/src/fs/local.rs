//! Filesystem operations on the controller host.
//!
//! Inside this module we refer to `tokio::fs` by its fully qualified path to
//! make it maximally clear what we are using.

use std::path::Path;

use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio_util::{
    compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt},
    io::StreamReader,
};
use tracing::{debug, instrument, trace};

use crate::{
    error::{Result, TransportError},
    fs::{Filesystem, unique_temp_path},
};

/// [`Filesystem`] over the controller host itself.
///
/// Used for the local binary cache, for the local half of staging transfers
/// and as the target of the shell transport.
#[derive(Clone, Debug, Default)]
pub struct LocalFilesystem {
    http: reqwest::Client,
}

impl LocalFilesystem {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    #[instrument(skip(self))]
    async fn force_mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|err| TransportError::filesystem("mkdir", path, err))
    }

    #[instrument(skip(self))]
    async fn download(&self, url: &str, destination: &str) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| TransportError::filesystem("download", destination, err))?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|err| TransportError::filesystem("download", destination, err))?;
        let bytes = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|err| TransportError::filesystem("download", destination, err))?;
        trace!(url, destination, bytes, "downloaded file");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path, "nothing to delete, file does not exist");
                Ok(())
            }
            Err(err) => Err(TransportError::filesystem("delete", path, err)),
        }
    }

    #[instrument(skip(self))]
    async fn link(&self, src: &str, dst: &str) -> Result<()> {
        tokio::fs::symlink(src, dst)
            .await
            .map_err(|err| TransportError::filesystem("link", dst, err))
    }

    #[instrument(skip(self))]
    async fn make_executable(&self, path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| TransportError::filesystem("chmod", path, err))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        tokio::fs::set_permissions(path, permissions)
            .await
            .map_err(|err| TransportError::filesystem("chmod", path, err))
    }

    #[instrument(skip(self))]
    async fn copy_to(&self, local_path: &str, remote_path: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
        }
        tokio::fs::copy(local_path, remote_path)
            .await
            .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
        Ok(())
    }

    #[instrument(skip(self, files))]
    async fn pack(&self, archive_path: &str, src_path: &str, files: &[String]) -> Result<()> {
        let members = if files.is_empty() {
            list_members(src_path).await?
        } else {
            files.to_vec()
        };

        let file = tokio::fs::File::create(archive_path)
            .await
            .map_err(|err| TransportError::filesystem("pack", archive_path, err))?;
        let encoder = GzipEncoder::new(BufWriter::new(file));
        let mut builder = async_tar::Builder::new(encoder.compat_write());
        for member in &members {
            let full = format!("{src_path}/{member}");
            builder
                .append_path_with_name(&full, member.as_str())
                .await
                .map_err(|err| TransportError::filesystem("pack", full, err))?;
        }
        let mut encoder = builder
            .into_inner()
            .await
            .map_err(|err| TransportError::filesystem("pack", archive_path, err))?
            .into_inner();
        encoder
            .shutdown()
            .await
            .map_err(|err| TransportError::filesystem("pack", archive_path, err))?;
        trace!(archive_path, members = members.len(), "packed archive");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpack(&self, archive_path: &str, dst_path: &str) -> Result<()> {
        let file = tokio::fs::File::open(archive_path)
            .await
            .map_err(|err| TransportError::filesystem("unpack", archive_path, err))?;
        let decoder = GzipDecoder::new(BufReader::new(file));
        let archive = async_tar::Archive::new(decoder.compat());
        archive
            .unpack(dst_path)
            .await
            .map_err(|err| TransportError::filesystem("unpack", dst_path, err))
    }

    #[instrument(skip(self))]
    async fn file_exists(&self, path: &str) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TransportError::filesystem("stat", path, err)),
        }
    }

    fn temp_dir_path(&self) -> String {
        unique_temp_path()
    }

    #[instrument(skip(self))]
    async fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        tokio::fs::rename(src, dst)
            .await
            .map_err(|err| TransportError::filesystem("move", dst, err))
    }
}

/// Everything directly inside `src_path`, hidden entries included.
async fn list_members(src_path: &str) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(src_path)
        .await
        .map_err(|err| TransportError::filesystem("pack", src_path, err))?;
    let mut members = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| TransportError::filesystem("pack", src_path, err))?
    {
        members.push(entry.file_name().to_string_lossy().into_owned());
    }
    members.sort();
    Ok(members)
}
