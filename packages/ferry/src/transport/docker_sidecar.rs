//! Temporary docker container transport.
//!
//! Launches a fresh container that shares all volumes of an original
//! application container (`--volumes-from` semantics), runs the backup
//! inside it and force-removes it on release. Useful when the application
//! image lacks a shell or the tooling the backup needs.

use bollard::Docker;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    binaries::{
        RequiredBinary, copy_encryption_keys, download_required_tools, transfer_required_tools,
    },
    command::{CommandFactory, Operation, create_backup_maker_command},
    definition::BackupDefinition,
    docker::{
        DockerExecSession, connect, ensure_exists, exec as docker_exec, force_remove_container,
        pull_image, run_sidecar_container,
    },
    error::{Result, TransportError},
    exec::{ExecSession, shell_join},
    fs::{DockerFilesystem, LocalFilesystem},
    settings::{self, TARGET_ENV_BIN_PATH, TARGET_ENV_VERSIONS_PATH},
    transport::{Transport, parse_spec},
};

/// How long the temporary container sleeps while the backup runs inside it.
const SIDECAR_SLEEP_SECONDS: u64 = 3600;

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Deserialize)]
struct DockerSidecarSpec {
    orig_container: String,
    temp_container_image: String,
    #[serde(default = "default_shell")]
    shell: String,
}

/// Runs the backup in a temporary container sharing the original container's
/// volumes.
pub struct DockerSidecarTransport {
    orig_container: String,
    image: String,
    shell: String,
    local_bin_path: String,
    local_versions_path: String,
    command_factory: CommandFactory,
    docker: Option<Docker>,
    binaries: Vec<RequiredBinary>,
    sidecar: Option<String>,
    session: Option<DockerExecSession>,
}

impl std::fmt::Debug for DockerSidecarTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSidecarTransport")
            .finish_non_exhaustive()
    }
}

impl DockerSidecarTransport {
    pub fn new(spec: &serde_json::Value) -> Result<Self> {
        let spec: DockerSidecarSpec = parse_spec(spec)?;
        Ok(Self {
            orig_container: spec.orig_container,
            image: spec.temp_container_image,
            shell: spec.shell,
            local_bin_path: settings::local_bin_path()?.to_string_lossy().into_owned(),
            local_versions_path: settings::local_versions_path()?
                .to_string_lossy()
                .into_owned(),
            command_factory: create_backup_maker_command,
            docker: None,
            binaries: Vec::new(),
            sidecar: None,
            session: None,
        })
    }

    /// Recognised specification options.
    pub fn specification_schema() -> serde_json::Value {
        serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["orig_container", "temp_container_image"],
            "properties": {
                "orig_container": {
                    "type": "string",
                    "example": "my-app"
                },
                "temp_container_image": {
                    "type": "string",
                    "example": "ghcr.io/mirrorshub/docker/alpine:3.14"
                },
                "shell": {
                    "type": "string",
                    "example": "/bin/bash",
                    "default": "/bin/sh"
                }
            }
        })
    }

    /// Substitute the command assembly, e.g. to run a fixed command in tests.
    pub fn with_command_factory(mut self, factory: CommandFactory) -> Self {
        self.command_factory = factory;
        self
    }

    fn docker(&self) -> Result<&Docker> {
        self.docker
            .as_ref()
            .ok_or_else(|| TransportError::configuration("prepare_environment was not run"))
    }
}

#[async_trait::async_trait]
impl Transport for DockerSidecarTransport {
    #[instrument(skip_all, fields(orig_container = %self.orig_container))]
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()> {
        let docker = connect()?;
        ensure_exists(&docker, &self.orig_container).await?;
        self.docker = Some(docker);

        let fs = LocalFilesystem::new();
        download_required_tools(&fs, &self.local_bin_path, &self.local_versions_path, &binaries)
            .await?;
        self.binaries = binaries;
        Ok(())
    }

    #[instrument(skip_all, fields(orig_container = %self.orig_container))]
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let docker = self.docker()?.clone();

        pull_image(&docker, &self.image).await?;
        let sidecar_name = format!("{}-backup", self.orig_container);
        run_sidecar_container(
            &docker,
            &sidecar_name,
            &self.image,
            &self.orig_container,
            SIDECAR_SLEEP_SECONDS,
        )
        .await?;
        self.sidecar = Some(sidecar_name.clone());

        let local = LocalFilesystem::new();
        let sidecar_fs = DockerFilesystem::new(docker.clone(), &sidecar_name);
        copy_encryption_keys(
            &local,
            &sidecar_fs,
            definition.encryption().public_key_path(),
            definition.encryption().private_key_path(),
        )
        .await?;
        transfer_required_tools(
            &local,
            &sidecar_fs,
            TARGET_ENV_BIN_PATH,
            TARGET_ENV_VERSIONS_PATH,
            &self.local_versions_path,
            &self.binaries,
        )
        .await?;

        let argv =
            (self.command_factory)(command, definition, operation, version, TARGET_ENV_BIN_PATH);
        debug!(?argv, "exec of the backup process inside the temporary container");
        let wrapped = vec![self.shell.clone(), "-c".to_string(), shell_join(&argv)];
        self.session = Some(docker_exec(&docker, &sidecar_name, wrapped).await?);
        Ok(())
    }

    async fn watch(&mut self) -> Result<bool> {
        let session = self.session.as_mut().ok_or_else(|| {
            TransportError::configuration("no scheduled process to watch")
        })?;
        session.watch(&mut |line: &str| debug!("{line}")).await?;
        session.succeeded().await
    }

    /// Force-remove the temporary container. Runs on every exit path.
    async fn release(&mut self) -> Result<()> {
        let Some(sidecar) = self.sidecar.take() else {
            return Ok(());
        };
        let docker = self.docker()?;
        force_remove_container(docker, &sidecar).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn both_containers_are_required() {
        let err = DockerSidecarTransport::new(&serde_json::json!({
            "orig_container": "nginx-app"
        }))
        .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn release_without_a_sidecar_is_a_no_op() {
        let mut transport = DockerSidecarTransport::new(&serde_json::json!({
            "orig_container": "nginx-app",
            "temp_container_image": "ghcr.io/mirrorshub/docker/alpine:3.14",
        }))
        .unwrap();

        // No sidecar was created and no daemon connection exists; release
        // must still succeed.
        futures::executor::block_on(transport.release()).unwrap();
    }
}
