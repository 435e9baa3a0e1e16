//! Local shell transport: runs the backup process as a subprocess of the
//! controller itself.

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    binaries::{RequiredBinary, download_required_tools, link_binaries},
    command::{CommandFactory, Operation, create_backup_maker_command},
    definition::BackupDefinition,
    error::{Result, TransportError},
    exec::{ExecSession, LocalSession, shell_join},
    fs::LocalFilesystem,
    settings,
    transport::{Transport, parse_spec},
};

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[derive(Debug, Deserialize)]
struct ShellSpec {
    #[serde(default = "default_shell")]
    shell: String,
}

/// Runs the assembled command through a configured local shell.
pub struct ShellTransport {
    shell: String,
    bin_path: String,
    versions_path: String,
    command_factory: CommandFactory,
    binaries: Vec<RequiredBinary>,
    session: Option<LocalSession>,
}

impl ShellTransport {
    pub fn new(spec: &serde_json::Value) -> Result<Self> {
        let spec: ShellSpec = parse_spec(spec)?;
        Ok(Self {
            shell: spec.shell,
            bin_path: settings::local_bin_path()?.to_string_lossy().into_owned(),
            versions_path: settings::local_versions_path()?
                .to_string_lossy()
                .into_owned(),
            command_factory: create_backup_maker_command,
            binaries: Vec::new(),
            session: None,
        })
    }

    /// Recognised specification options.
    pub fn specification_schema() -> serde_json::Value {
        serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
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

    /// Override where the binary cache lives. Useful when several sessions
    /// run in parallel and must not share a cache directory.
    pub fn with_cache_paths(
        mut self,
        bin_path: impl Into<String>,
        versions_path: impl Into<String>,
    ) -> Self {
        self.bin_path = bin_path.into();
        self.versions_path = versions_path.into();
        self
    }
}

#[async_trait::async_trait]
impl Transport for ShellTransport {
    #[instrument(skip_all)]
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()> {
        let fs = LocalFilesystem::new();
        download_required_tools(&fs, &self.bin_path, &self.versions_path, &binaries).await?;
        link_binaries(&fs, &self.bin_path, &self.versions_path, &binaries).await?;
        self.binaries = binaries;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let argv = (self.command_factory)(command, definition, operation, version, &self.bin_path);
        let command_line = shell_join(&argv);
        debug!(shell = %self.shell, command_line, "spawning local backup process");
        self.session = Some(LocalSession::spawn(&self.shell, &command_line)?);
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
        // The subprocess has no state to tear down.
        Ok(())
    }
}
