//! Filesystem operations inside a running docker container.
//!
//! Every operation shells out to the standard POSIX utilities through the
//! daemon's exec API. Exit codes from `docker exec` are reliable, so plain
//! status checking is enough here.

use async_trait::async_trait;
use bollard::Docker;
use tracing::{debug, instrument};

use crate::{
    docker::{exec as docker_exec, upload_file},
    error::{Result, TransportError},
    exec::{ExecSession, shell_join, shell_quote},
    fs::{Filesystem, unique_temp_path},
};

/// [`Filesystem`] over a running container.
#[derive(Clone)]
pub struct DockerFilesystem {
    docker: Docker,
    container: String,
}

impl DockerFilesystem {
    pub fn new(docker: Docker, container: impl Into<String>) -> Self {
        Self {
            docker,
            container: container.into(),
        }
    }

    /// Run an argv in the container and require a clean exit. Returns the
    /// captured output; failures carry it for diagnosis.
    async fn exec_checked(
        &self,
        command: Vec<String>,
        operation: &'static str,
        path: &str,
    ) -> Result<String> {
        let mut session = docker_exec(&self.docker, &self.container, command).await?;
        let output = session.read().await?;
        if !session.succeeded().await? {
            return Err(TransportError::Exec {
                output: format!(
                    "{operation} of '{path}' inside container '{}' failed: {output}",
                    self.container
                ),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Filesystem for DockerFilesystem {
    #[instrument(skip(self), fields(container = %self.container))]
    async fn force_mkdir(&self, path: &str) -> Result<()> {
        self.exec_checked(
            vec!["mkdir".into(), "-p".into(), path.into()],
            "mkdir",
            path,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn download(&self, url: &str, destination: &str) -> Result<()> {
        self.exec_checked(
            vec![
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

    #[instrument(skip(self), fields(container = %self.container))]
    async fn delete_file(&self, path: &str) -> Result<()> {
        match self
            .exec_checked(vec!["rm".into(), path.into()], "delete", path)
            .await
        {
            Ok(_) => Ok(()),
            Err(TransportError::Exec { .. }) => {
                debug!(path, "cannot remove file, maybe it does not exist");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.exec_checked(
            vec!["ln".into(), "-s".into(), src.into(), dst.into()],
            "link",
            dst,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn make_executable(&self, path: &str) -> Result<()> {
        self.exec_checked(vec!["chmod".into(), "+x".into(), path.into()], "chmod", path)
            .await
            .map(drop)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn copy_to(&self, local_path: &str, remote_path: &str) -> Result<()> {
        upload_file(&self.docker, &self.container, local_path, remote_path).await
    }

    #[instrument(skip(self, files), fields(container = %self.container))]
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
        self.exec_checked(
            vec!["/bin/sh".into(), "-c".into(), script],
            "pack",
            archive_path,
        )
        .await
        .map(drop)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn unpack(&self, archive_path: &str, dst_path: &str) -> Result<()> {
        self.exec_checked(
            vec![
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

    #[instrument(skip(self), fields(container = %self.container))]
    async fn file_exists(&self, path: &str) -> Result<bool> {
        let mut session = docker_exec(
            &self.docker,
            &self.container,
            vec!["test".into(), "-f".into(), path.into()],
        )
        .await?;
        session.read().await?;
        session.succeeded().await
    }

    fn temp_dir_path(&self) -> String {
        unique_temp_path()
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        self.exec_checked(vec!["mv".into(), src.into(), dst.into()], "move", dst)
            .await
            .map(drop)
    }
}
