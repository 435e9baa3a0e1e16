//! Docker exec transport: runs the backup process inside an existing,
//! long-lived container.

use bollard::Docker;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    binaries::{
        RequiredBinary, copy_encryption_keys, download_required_tools, transfer_required_tools,
    },
    command::{CommandFactory, Operation, create_backup_maker_command},
    definition::BackupDefinition,
    docker::{DockerExecSession, connect, ensure_running, exec as docker_exec},
    error::{Result, TransportError},
    exec::{ExecSession, shell_join},
    fs::{DockerFilesystem, LocalFilesystem},
    settings::{self, TARGET_ENV_BIN_PATH, TARGET_ENV_VERSIONS_PATH},
    transport::{Transport, parse_spec},
};

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Deserialize)]
struct DockerExecSpec {
    container: String,
    #[serde(default = "default_shell")]
    shell: String,
}

/// Runs the assembled command through `docker exec` in a running container.
///
/// The container outlives the session, so release has nothing to tear down.
pub struct DockerExecTransport {
    container: String,
    shell: String,
    local_bin_path: String,
    local_versions_path: String,
    command_factory: CommandFactory,
    docker: Option<Docker>,
    binaries: Vec<RequiredBinary>,
    session: Option<DockerExecSession>,
}

impl std::fmt::Debug for DockerExecTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerExecTransport").finish_non_exhaustive()
    }
}

impl DockerExecTransport {
    pub fn new(spec: &serde_json::Value) -> Result<Self> {
        let spec: DockerExecSpec = parse_spec(spec)?;
        Ok(Self {
            container: spec.container,
            shell: spec.shell,
            local_bin_path: settings::local_bin_path()?.to_string_lossy().into_owned(),
            local_versions_path: settings::local_versions_path()?
                .to_string_lossy()
                .into_owned(),
            command_factory: create_backup_maker_command,
            docker: None,
            binaries: Vec::new(),
            session: None,
        })
    }

    /// Recognised specification options.
    pub fn specification_schema() -> serde_json::Value {
        serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["container"],
            "properties": {
                "container": {
                    "type": "string",
                    "example": "my-app"
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
impl Transport for DockerExecTransport {
    /// Pre-flight the container and fill the local binary cache. Staging into
    /// the container happens at schedule time, once the definition with the
    /// key material is known.
    #[instrument(skip_all, fields(container = %self.container))]
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()> {
        let docker = connect()?;
        ensure_running(&docker, &self.container).await?;
        self.docker = Some(docker);

        let fs = LocalFilesystem::new();
        download_required_tools(&fs, &self.local_bin_path, &self.local_versions_path, &binaries)
            .await?;
        self.binaries = binaries;
        Ok(())
    }

    #[instrument(skip_all, fields(container = %self.container))]
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let docker = self.docker()?.clone();
        let local = LocalFilesystem::new();
        let container_fs = DockerFilesystem::new(docker.clone(), &self.container);

        copy_encryption_keys(
            &local,
            &container_fs,
            definition.encryption().public_key_path(),
            definition.encryption().private_key_path(),
        )
        .await?;
        transfer_required_tools(
            &local,
            &container_fs,
            TARGET_ENV_BIN_PATH,
            TARGET_ENV_VERSIONS_PATH,
            &self.local_versions_path,
            &self.binaries,
        )
        .await?;

        let argv =
            (self.command_factory)(command, definition, operation, version, TARGET_ENV_BIN_PATH);
        debug!(?argv, "docker exec of the backup process");
        let wrapped = vec![self.shell.clone(), "-c".to_string(), shell_join(&argv)];
        self.session = Some(docker_exec(&docker, &self.container, wrapped).await?);
        Ok(())
    }

    async fn watch(&mut self) -> Result<bool> {
        let session = self.session.as_mut().ok_or_else(|| {
            TransportError::configuration("no scheduled process to watch")
        })?;
        session.watch(&mut |line: &str| debug!("{line}")).await?;
        session.succeeded().await
    }

    async fn release(&mut self) -> Result<()> {
        // The container is long-lived and owned by someone else.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn container_is_required() {
        let err = DockerExecTransport::new(&serde_json::json!({ "shell": "/bin/sh" })).unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn shell_defaults_to_sh() {
        let transport =
            DockerExecTransport::new(&serde_json::json!({ "container": "nginx-app" })).unwrap();
        assert_eq!(transport.container, "nginx-app");
        assert_eq!(transport.shell, "/bin/sh");
    }
}
