//! Kubernetes pod-exec transport.
//!
//! Performs an exec into an existing, running pod to run the backup in
//! place: locates the pod by label selector, waits for it and its containers
//! to be ready, stages keys and helper binaries over the exec channel, then
//! starts the backup process.

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{
    binaries::{
        RequiredBinary, copy_encryption_keys, download_required_tools, transfer_required_tools,
    },
    cluster::{ClusterApi, PodExecSession, find_pod_name, pod_exec, wait_for_pod_ready},
    command::{CommandFactory, Operation, create_backup_maker_command},
    definition::BackupDefinition,
    error::{Result, TransportError},
    exec::ExecSession,
    fs::{Filesystem, LocalFilesystem, PodFilesystem},
    settings::{
        self, GPG_PRIVATE_KEY_PATH, GPG_PUBLIC_KEY_PATH, TARGET_ENV_BIN_PATH,
        TARGET_ENV_VERSIONS_PATH,
    },
    transport::{Transport, parse_spec},
};

fn default_namespace() -> String {
    "default".to_string()
}

fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize)]
struct PodExecSpec {
    selector: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

/// Runs the backup inside an already-running pod found by label selector.
pub struct PodExecTransport {
    selector: String,
    namespace: String,
    timeout: u64,
    local_bin_path: String,
    local_versions_path: String,
    command_factory: CommandFactory,
    cluster: ClusterApi,
    binaries: Vec<RequiredBinary>,
    staged_pod: Option<String>,
    session: Option<PodExecSession>,
}

impl std::fmt::Debug for PodExecTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodExecTransport").finish_non_exhaustive()
    }
}

impl PodExecTransport {
    pub fn new(spec: &serde_json::Value) -> Result<Self> {
        let spec: PodExecSpec = parse_spec(spec)?;
        Self::from_parts(spec.selector, spec.namespace, spec.timeout)
    }

    pub(crate) fn from_parts(selector: String, namespace: String, timeout: u64) -> Result<Self> {
        Ok(Self {
            selector,
            namespace,
            timeout,
            local_bin_path: settings::local_bin_path()?.to_string_lossy().into_owned(),
            local_versions_path: settings::local_versions_path()?
                .to_string_lossy()
                .into_owned(),
            command_factory: create_backup_maker_command,
            cluster: ClusterApi::new(),
            binaries: Vec::new(),
            staged_pod: None,
            session: None,
        })
    }

    /// Recognised specification options.
    pub fn specification_schema() -> serde_json::Value {
        serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["selector"],
            "properties": {
                "selector": {
                    "type": "string",
                    "example": "my-label=myvalue"
                },
                "namespace": {
                    "type": "string",
                    "example": "prod",
                    "default": "default"
                },
                "timeout": {
                    "type": "integer",
                    "default": 120,
                    "example": 120
                }
            }
        })
    }

    /// Substitute the command assembly, e.g. to run a fixed command in tests.
    pub fn with_command_factory(mut self, factory: CommandFactory) -> Self {
        self.command_factory = factory;
        self
    }

    pub(crate) fn selector(&self) -> &str {
        &self.selector
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn timeout(&self) -> u64 {
        self.timeout
    }

    pub(crate) fn cluster(&self) -> &ClusterApi {
        &self.cluster
    }

    pub(crate) async fn pods(&self) -> Result<Api<Pod>> {
        self.cluster.pods(&self.namespace).await
    }

    /// The shared tail of scheduling: wait for `pod_name` to be ready, stage
    /// keys and binaries into it, then exec the assembled command.
    pub(crate) async fn execute_when_ready(
        &mut self,
        pod_name: &str,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let pods = self.pods().await?;
        wait_for_pod_ready(&pods, pod_name, &self.namespace, self.timeout).await?;
        self.prepare_environment_inside_pod(&pods, pod_name, definition)
            .await?;

        let argv =
            (self.command_factory)(command, definition, operation, version, TARGET_ENV_BIN_PATH);
        debug!(?argv, pod = pod_name, "pod exec of the backup process");
        self.session = Some(pod_exec(&pods, pod_name, argv).await?);
        self.staged_pod = Some(pod_name.to_string());
        Ok(())
    }

    /// Populate the pod with the encryption keys and required tools.
    async fn prepare_environment_inside_pod(
        &self,
        pods: &Api<Pod>,
        pod_name: &str,
        definition: &BackupDefinition,
    ) -> Result<()> {
        let local = LocalFilesystem::new();
        let pod_fs = PodFilesystem::new(pods.clone(), pod_name);
        copy_encryption_keys(
            &local,
            &pod_fs,
            definition.encryption().public_key_path(),
            definition.encryption().private_key_path(),
        )
        .await?;
        transfer_required_tools(
            &local,
            &pod_fs,
            TARGET_ENV_BIN_PATH,
            TARGET_ENV_VERSIONS_PATH,
            &self.local_versions_path,
            &self.binaries,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for PodExecTransport {
    #[instrument(skip_all, fields(selector = %self.selector, namespace = %self.namespace))]
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()> {
        let fs = LocalFilesystem::new();
        download_required_tools(&fs, &self.local_bin_path, &self.local_versions_path, &binaries)
            .await?;
        self.binaries = binaries;
        Ok(())
    }

    #[instrument(skip_all, fields(selector = %self.selector, namespace = %self.namespace))]
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let pods = self.pods().await?;
        let pod_name = find_pod_name(&pods, &self.selector, &self.namespace).await?;
        self.execute_when_ready(&pod_name, command, definition, operation, version)
            .await
    }

    async fn watch(&mut self) -> Result<bool> {
        let session = self.session.as_mut().ok_or_else(|| {
            TransportError::configuration("no scheduled process to watch")
        })?;
        session.watch(&mut |line: &str| debug!("{line}")).await?;
        session.succeeded().await
    }

    /// Best-effort wipe of the staged key material from the pod. Failures
    /// are logged and never override an earlier error.
    async fn release(&mut self) -> Result<()> {
        let Some(pod_name) = self.staged_pod.take() else {
            return Ok(());
        };
        let pods = match self.pods().await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(error = %err, "cannot reach the cluster to wipe staged keys");
                return Ok(());
            }
        };
        let pod_fs = PodFilesystem::new(pods, &pod_name);
        for key in [GPG_PUBLIC_KEY_PATH, GPG_PRIVATE_KEY_PATH] {
            if let Err(err) = pod_fs.delete_file(key).await {
                warn!(error = %err, key, "failed to wipe a staged key from the pod");
            }
        }
        Ok(())
    }

    /// The pod runs the application image; the caller decides which helpers
    /// to stage into it.
    fn required_binaries(&self) -> Vec<RequiredBinary> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn selector_is_required() {
        let err = PodExecTransport::new(&serde_json::json!({ "namespace": "prod" })).unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn namespace_and_timeout_have_defaults() {
        let transport =
            PodExecTransport::new(&serde_json::json!({ "selector": "app=nginx" })).unwrap();
        assert_eq!(transport.namespace(), "default");
        assert_eq!(transport.timeout(), 120);
        assert_eq!(transport.selector(), "app=nginx");
    }

    #[test]
    fn timeout_is_configurable() {
        let transport = PodExecTransport::new(&serde_json::json!({
            "selector": "app=nginx",
            "namespace": "prod",
            "timeout": 30,
        }))
        .unwrap();
        assert_eq!(transport.timeout(), 30);
    }
}
