//! Filesystem operations inside a kubernetes pod.
//!
//! Operations shell out to POSIX utilities through the exec channel. The
//! websocket exec transport has historically dropped exit codes, so every
//! command is wrapped as `sh -c "<cmd> && echo '<sentinel>'"`: success
//! requires both a clean error channel and the sentinel in captured stdout.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::{
    cluster::{pod_attach, pod_exec},
    error::{Result, TransportError},
    exec::{ExecSession, shell_join, shell_quote},
    fs::{Filesystem, unique_temp_path},
    settings::EXIT_SENTINEL,
};

/// Chunk size used when streaming files into the pod over the exec channel.
const COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// [`Filesystem`] over a running pod.
#[derive(Clone)]
pub struct PodFilesystem {
    pods: Api<Pod>,
    pod: String,
}

impl PodFilesystem {
    pub fn new(pods: Api<Pod>, pod: impl Into<String>) -> Self {
        Self {
            pods,
            pod: pod.into(),
        }
    }

    /// Run a shell script in the pod behind the sentinel guard.
    async fn exec_script(&self, script: String, operation: &'static str, path: &str) -> Result<String> {
        let wrapped = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("{script} && echo '{EXIT_SENTINEL}'"),
        ];
        let mut session = pod_exec(&self.pods, &self.pod, wrapped).await?;
        let output = session.read().await?;
        if !session.succeeded().await? || !sentinel_present(&output) {
            return Err(TransportError::Exec {
                output: format!(
                    "{operation} of '{path}' inside pod '{}' failed: {output}",
                    self.pod
                ),
            });
        }
        Ok(output)
    }

    /// Run an argv in the pod behind the sentinel guard.
    async fn exec_checked(
        &self,
        command: &[String],
        operation: &'static str,
        path: &str,
    ) -> Result<String> {
        self.exec_script(shell_join(command), operation, path).await
    }
}

#[async_trait]
impl Filesystem for PodFilesystem {
    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn force_mkdir(&self, path: &str) -> Result<()> {
        self.exec_checked(
            &["mkdir".into(), "-p".into(), path.into()],
            "mkdir",
            path,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn download(&self, url: &str, destination: &str) -> Result<()> {
        self.exec_checked(
            &[
                "curl".into(),
                "-s".into(),
                "-L".into(),
                "--output".into(),
                destination.into(),
                url.into(),
            ],
            "download",
            destination,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        match self
            .exec_checked(&["rm".into(), path.into()], "delete", path)
            .await
        {
            Ok(_) => Ok(()),
            Err(TransportError::Exec { .. }) => {
                debug!(path, "cannot remove file inside pod, maybe it does not exist");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.exec_checked(
            &["ln".into(), "-s".into(), src.into(), dst.into()],
            "link",
            dst,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn make_executable(&self, path: &str) -> Result<()> {
        self.exec_checked(&["chmod".into(), "+x".into(), path.into()], "chmod", path)
            .await
            .map(drop)
    }

    /// Stream a local file to the pod by piping it into `cat` over the exec
    /// channel, one megabyte at a time.
    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn copy_to(&self, local_path: &str, remote_path: &str) -> Result<()> {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("cat - > {}", shell_quote(remote_path)),
        ];
        let mut attached = pod_attach(&self.pods, &self.pod, command, true).await?;
        let mut stdin = attached.stdin().ok_or_else(|| TransportError::Buffering {
            stream: "pod exec stdin".to_string(),
        })?;

        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|err| TransportError::filesystem("copy", local_path, err))?;
        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|err| TransportError::filesystem("copy", local_path, err))?;
            if read == 0 {
                break;
            }
            stdin
                .write_all(&buffer[..read])
                .await
                .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
        }
        stdin
            .shutdown()
            .await
            .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
        drop(stdin);
        attached
            .join()
            .await
            .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
        Ok(())
    }

    #[instrument(skip(self, files), fields(pod = %self.pod))]
    async fn pack(&self, archive_path: &str, src_path: &str, files: &[String]) -> Result<()> {
        let members = if files.is_empty() {
            ".".to_string()
        } else {
            shell_join(files)
        };
        let script = format!(
            "cd {} && tar -zcf {} {members}",
            shell_quote(src_path),
            shell_quote(archive_path),
        );
        self.exec_script(script, "pack", archive_path).await.map(drop)
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn unpack(&self, archive_path: &str, dst_path: &str) -> Result<()> {
        self.exec_checked(
            &[
                "tar".into(),
                "xf".into(),
                archive_path.into(),
                "--directory".into(),
                dst_path.into(),
            ],
            "unpack",
            dst_path,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn file_exists(&self, path: &str) -> Result<bool> {
        match self
            .exec_checked(&["test".into(), "-f".into(), path.into()], "stat", path)
            .await
        {
            Ok(_) => Ok(true),
            Err(TransportError::Exec { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn temp_dir_path(&self) -> String {
        unique_temp_path()
    }

    #[instrument(skip(self), fields(pod = %self.pod))]
    async fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        self.exec_checked(&["mv".into(), src.into(), dst.into()], "move", dst)
            .await
            .map(drop)
    }
}

/// Whether a wrapped command's output carries the success sentinel.
pub(crate) fn sentinel_present(output: &str) -> bool {
    output.contains(EXIT_SENTINEL)
}
