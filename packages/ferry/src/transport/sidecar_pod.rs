//! Kubernetes sidecar-pod transport.
//!
//! Creates a temporary pod next to the original application pod, inheriting
//! all of its volumes, and runs the backup there. Optionally scales the
//! owning workload controller down to zero first, so the application and the
//! backup never run on the shared volumes at the same time; the controller is
//! scaled back to its recorded replica count on release, no matter how the
//! session ended.

use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use crate::{
    binaries::RequiredBinary,
    cluster::{
        ReplicaToScale, SidecarPodIdentity, build_sidecar_pod, create_pod, delete_pod,
        find_pod_name, inherited_volumes, owner_references, scale_deployment, wait_for_pod_ready,
    },
    command::{CommandFactory, Operation},
    definition::BackupDefinition,
    error::Result,
    transport::{Transport, parse_spec, pod_exec::PodExecTransport},
};

fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "ghcr.io/riotkit-org/backup-maker-env:latest".to_string()
}

fn default_timeout() -> u64 {
    3600
}

fn default_pod_suffix() -> String {
    "-backup".to_string()
}

#[derive(Debug, Deserialize)]
struct SidecarPodSpec {
    selector: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_image")]
    image: String,
    #[serde(default, rename = "scaleDown")]
    scale_down: bool,
    #[serde(default = "default_pod_suffix", rename = "podSuffix")]
    pod_suffix: String,
    #[serde(default = "default_timeout", rename = "scaleTimeout")]
    scale_timeout: u64,
}

/// Runs the backup in a temporary pod that reuses the original pod's
/// volumes.
///
/// Holds a pod-exec strategy and delegates the shared wait → stage → exec
/// sequence to it once the sidecar pod exists.
pub struct SidecarPodTransport {
    exec: PodExecTransport,
    image: String,
    timeout: u64,
    scale_down: bool,
    pod_suffix: String,
    scale_timeout: u64,
    replicas_to_scale: Vec<ReplicaToScale>,
    sidecar: Option<SidecarPodIdentity>,
}

impl std::fmt::Debug for SidecarPodTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarPodTransport").finish_non_exhaustive()
    }
}

impl SidecarPodTransport {
    pub fn new(spec: &serde_json::Value) -> Result<Self> {
        let spec: SidecarPodSpec = parse_spec(spec)?;
        let exec =
            PodExecTransport::from_parts(spec.selector, spec.namespace, spec.timeout)?;
        Ok(Self {
            exec,
            image: spec.image,
            timeout: spec.timeout,
            scale_down: spec.scale_down,
            pod_suffix: spec.pod_suffix,
            scale_timeout: spec.scale_timeout,
            replicas_to_scale: Vec::new(),
            sidecar: None,
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
                "image": {
                    "type": "string",
                    "example": "ghcr.io/riotkit-org/backup-maker-env:latest",
                    "default": "ghcr.io/riotkit-org/backup-maker-env:latest"
                },
                "timeout": {
                    "type": "integer",
                    "default": 3600,
                    "example": 3600
                },
                "scaleDown": {
                    "type": "boolean",
                    "default": false,
                    "example": false
                },
                "podSuffix": {
                    "type": "string",
                    "default": "-backup",
                    "example": "-backup"
                },
                "scaleTimeout": {
                    "type": "integer",
                    "default": 3600,
                    "example": 3600
                }
            }
        })
    }

    /// Substitute the command assembly, e.g. to run a fixed command in tests.
    pub fn with_command_factory(mut self, factory: CommandFactory) -> Self {
        self.exec = self.exec.with_command_factory(factory);
        self
    }

    /// Scale the controllers owning `pod_name` down to zero, recording their
    /// previous replica counts for release.
    ///
    /// Pods are owned by ReplicaSets which are owned by Deployments, so the
    /// traversal walks owner references transitively. Unsupported controller
    /// kinds are logged and skipped.
    async fn scale_pod_owner(&mut self, pod_name: &str) -> Result<()> {
        let pods = self.exec.pods().await?;
        let pod = pods.get(pod_name).await?;
        let mut queue = owner_references(&pod.metadata);
        if queue.is_empty() {
            warn!(pod = pod_name, "no pod owner found through owner references");
            return Ok(());
        }

        let namespace = self.exec.namespace().to_string();
        let replica_sets = self.exec.cluster().replica_sets(&namespace).await?;
        let deployments = self.exec.cluster().deployments(&namespace).await?;
        while let Some(owner) = queue.pop() {
            match owner.kind.as_str() {
                "ReplicaSet" => {
                    let replica_set = replica_sets.get(&owner.name).await?;
                    queue.extend(owner_references(&replica_set.metadata));
                }
                "Deployment" => {
                    let replicas = deployments
                        .get(&owner.name)
                        .await?
                        .spec
                        .and_then(|spec| spec.replicas)
                        .unwrap_or(0);
                    self.replicas_to_scale.push(ReplicaToScale {
                        kind: "Deployment".to_string(),
                        name: owner.name.clone(),
                        namespace: namespace.clone(),
                        replicas,
                    });
                    scale_deployment(&deployments, &owner.name, &namespace, 0, self.scale_timeout)
                        .await?;
                }
                kind => {
                    warn!(kind, "unsupported controller type, will not attempt to scale it");
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for SidecarPodTransport {
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()> {
        self.exec.prepare_environment(binaries).await
    }

    #[instrument(skip_all, fields(selector = %self.exec.selector(), namespace = %self.exec.namespace()))]
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()> {
        let pods = self.exec.pods().await?;
        let namespace = self.exec.namespace().to_string();
        let original_pod =
            find_pod_name(&pods, self.exec.selector(), &namespace).await?;

        if self.scale_down {
            self.scale_pod_owner(&original_pod).await?;
        }

        debug!(pod = %original_pod, "copying volumes specification from the original pod");
        wait_for_pod_ready(&pods, &original_pod, &namespace, self.exec.timeout()).await?;
        let pod = pods.get(&original_pod).await?;
        let (volumes, mounts) = inherited_volumes(&pod);

        let sidecar_name = format!("{original_pod}{}", self.pod_suffix);
        let sidecar_pod = build_sidecar_pod(
            &original_pod,
            &sidecar_name,
            &namespace,
            &self.image,
            self.timeout,
            volumes,
            mounts,
        );
        create_pod(&pods, &sidecar_pod).await?;
        self.sidecar = Some(SidecarPodIdentity {
            namespace,
            name: sidecar_name.clone(),
        });

        self.exec
            .execute_when_ready(&sidecar_name, command, definition, operation, version)
            .await
    }

    async fn watch(&mut self) -> Result<bool> {
        self.exec.watch().await
    }

    /// Delete the sidecar pod, then scale every recorded controller back to
    /// its original replica count.
    ///
    /// Terminate-then-restore is mandatory: the cluster must never run the
    /// original workload and the backup sidecar on shared volumes at the
    /// same time. Each step is attempted regardless of earlier failures; the
    /// first failure is reported once everything was tried.
    async fn release(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(sidecar) = self.sidecar.take() {
            match self.exec.cluster().pods(&sidecar.namespace).await {
                Ok(pods) => {
                    if let Err(err) = delete_pod(&pods, &sidecar.name).await {
                        error!(pod = %sidecar.name, error = %err, "failed to delete the temporary pod");
                        first_error.get_or_insert(err);
                    }
                }
                Err(err) => {
                    error!(pod = %sidecar.name, error = %err, "cannot reach the cluster to delete the temporary pod");
                    first_error.get_or_insert(err);
                }
            }
        }

        for replica in std::mem::take(&mut self.replicas_to_scale) {
            let deployments = match self.exec.cluster().deployments(&replica.namespace).await {
                Ok(deployments) => deployments,
                Err(err) => {
                    error!(controller = %replica.name, error = %err, "cannot reach the cluster to restore the controller");
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            if let Err(err) = scale_deployment(
                &deployments,
                &replica.name,
                &replica.namespace,
                replica.replicas,
                self.scale_timeout,
            )
            .await
            {
                error!(controller = %replica.name, error = %err, "failed to scale the controller back up");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn required_binaries(&self) -> Vec<RequiredBinary> {
        self.exec.required_binaries()
    }
}
