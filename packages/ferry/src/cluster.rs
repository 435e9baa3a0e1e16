//! Kubernetes cluster access for the pod transports.
//!
//! Wraps the cluster API surface the transports need: pod discovery by label
//! selector, readiness waits, exec sessions over the websocket attach
//! channel, temporary pod lifecycle and workload controller scaling.

use std::{collections::HashSet, future::Future, pin::Pin};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet},
        core::v1::{Container, Pod, PodSpec, Volume, VolumeMount},
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Status},
};
use kube::{
    Client,
    api::{Api, AttachParams, AttachedProcess, DeleteParams, ListParams, Patch, PatchParams},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, Lines},
    sync::OnceCell,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, TransportError},
    exec::{ExecSession, LinePrinter},
    settings::ORIGINAL_POD_LABEL,
};

/// Pod phases that count as schedulable for an exec.
const READY_PHASES: [&str; 4] = ["Ready", "Healthy", "True", "Running"];

/// A workload controller that was scaled down and has to be scaled back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaToScale {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
}

/// Identity of a temporary sidecar pod owned by a transport session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidecarPodIdentity {
    pub namespace: String,
    pub name: String,
}

/// Lazily-initialised cluster connection, built from the ambient kubeconfig
/// on first use.
#[derive(Default)]
pub struct ClusterApi {
    client: OnceCell<Client>,
}

impl ClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::try_default().await })
            .await?;
        Ok(client.clone())
    }

    pub async fn pods(&self, namespace: &str) -> Result<Api<Pod>> {
        Ok(Api::namespaced(self.client().await?, namespace))
    }

    pub async fn deployments(&self, namespace: &str) -> Result<Api<Deployment>> {
        Ok(Api::namespaced(self.client().await?, namespace))
    }

    pub async fn replica_sets(&self, namespace: &str) -> Result<Api<ReplicaSet>> {
        Ok(Api::namespaced(self.client().await?, namespace))
    }
}

/// Find the first pod matching `selector`.
#[instrument(skip(pods))]
pub async fn find_pod_name(pods: &Api<Pod>, selector: &str, namespace: &str) -> Result<String> {
    let list = pods
        .list(&ListParams::default().labels(selector).limit(1))
        .await?;
    let name = list
        .items
        .into_iter()
        .next()
        .and_then(|pod| pod.metadata.name)
        .ok_or_else(|| TransportError::PodNotFound {
            selector: selector.to_string(),
            namespace: namespace.to_string(),
        })?;
    debug!(pod = %name, namespace, "found pod");
    Ok(name)
}

/// Whether the pod phase allows exec'ing into it.
pub fn phase_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| READY_PHASES.contains(&phase))
}

/// Whether every container in the pod is running, with nothing still waiting
/// or already terminated.
pub fn containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().all(|container| {
                container.state.as_ref().is_some_and(|state| {
                    state.running.is_some()
                        && state.waiting.is_none()
                        && state.terminated.is_none()
                })
            })
        })
}

/// Poll the pod once per second until it reaches a ready phase and all of its
/// containers have started, or `timeout_secs` elapses.
#[instrument(skip(pods))]
pub async fn wait_for_pod_ready(
    pods: &Api<Pod>,
    pod_name: &str,
    namespace: &str,
    timeout_secs: u64,
) -> Result<()> {
    debug!("waiting for pod to be ready");
    for _ in 0..timeout_secs {
        let pod = pods.get(pod_name).await?;
        if phase_ready(&pod) {
            wait_for_containers(pods, pod_name, timeout_secs).await?;
            let phase = pod
                .status
                .and_then(|status| status.phase)
                .unwrap_or_default();
            info!(phase, "pod entered a ready state");
            sleep(Duration::from_secs(1)).await;
            return Ok(());
        }
        debug!(phase = ?pod.status.and_then(|status| status.phase), "pod not ready yet");
        sleep(Duration::from_secs(1)).await;
    }
    Err(TransportError::PodReadinessTimeout {
        pod: pod_name.to_string(),
        namespace: namespace.to_string(),
    })
}

/// A pod can be running while its containers are still initialising; wait for
/// the containers as a second stage.
async fn wait_for_containers(pods: &Api<Pod>, pod_name: &str, timeout_secs: u64) -> Result<()> {
    for _ in 0..timeout_secs {
        if containers_ready(&pods.get(pod_name).await?) {
            info!("all containers in the pod have started");
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }
    Ok(())
}

/// Attach to a fresh exec in the pod, with output channels always captured.
pub(crate) async fn pod_attach(
    pods: &Api<Pod>,
    pod_name: &str,
    command: Vec<String>,
    stdin: bool,
) -> Result<AttachedProcess> {
    let params = AttachParams::default()
        .stdin(stdin)
        .stdout(true)
        .stderr(true);
    Ok(pods.exec(pod_name, command, &params).await?)
}

/// Execute a command inside a pod and hand back the session.
#[instrument(skip(pods, command))]
pub async fn pod_exec(pods: &Api<Pod>, pod_name: &str, command: Vec<String>) -> Result<PodExecSession> {
    debug!(?command, "pod exec");
    let attached = pod_attach(pods, pod_name, command, false).await?;
    Ok(PodExecSession::from_attached(attached))
}

/// Create a temporary pod, translating a name conflict into
/// [`TransportError::PodCreationConflict`].
#[instrument(skip(pods, pod))]
pub async fn create_pod(pods: &Api<Pod>, pod: &Pod) -> Result<()> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    info!(pod = %name, "creating temporary pod");
    match pods.create(&Default::default(), pod).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response))
            if response.code == 409 || response.reason == "AlreadyExists" =>
        {
            Err(TransportError::PodCreationConflict { pod: name })
        }
        Err(err) => Err(err.into()),
    }
}

/// Delete a pod.
#[instrument(skip(pods))]
pub async fn delete_pod(pods: &Api<Pod>, pod_name: &str) -> Result<()> {
    info!(pod = pod_name, "clean up - deleting temporary pod");
    pods.delete(pod_name, &DeleteParams::default()).await?;
    Ok(())
}

/// Scale a deployment and wait until the cluster observes the new replica
/// count, polling once per second up to `timeout_secs`.
#[instrument(skip(deployments))]
pub async fn scale_deployment(
    deployments: &Api<Deployment>,
    name: &str,
    namespace: &str,
    replicas: i32,
    timeout_secs: u64,
) -> Result<()> {
    info!(deployment = name, namespace, replicas, "scaling deployment");
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });
    deployments
        .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    for _ in 0..timeout_secs {
        let current = deployments
            .get(name)
            .await?
            .spec
            .and_then(|spec| spec.replicas)
            .unwrap_or(0);
        if current == replicas {
            info!(replicas, "pod controller scaled");
            return Ok(());
        }
        debug!(current, desired = replicas, "waiting for the controller to scale");
        sleep(Duration::from_secs(1)).await;
    }
    Err(TransportError::CannotScale {
        name: name.to_string(),
        namespace: namespace.to_string(),
        replicas,
    })
}

/// Owner references of a resource, empty when it has none.
pub fn owner_references(metadata: &ObjectMeta) -> Vec<OwnerReference> {
    metadata.owner_references.clone().unwrap_or_default()
}

/// Volumes of the original pod plus the union of the volume mounts across its
/// containers, deduplicated by mount path. The first mount of a path wins;
/// later duplicates are logged and skipped. A pod without volumes yields an
/// empty inheritance.
pub fn inherited_volumes(pod: &Pod) -> (Vec<Volume>, Vec<VolumeMount>) {
    let Some(spec) = &pod.spec else {
        return (Vec::new(), Vec::new());
    };
    let volumes = spec.volumes.clone().unwrap_or_default();
    if volumes.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut mounts = Vec::new();
    let mut mounted_paths = HashSet::new();
    for container in &spec.containers {
        debug!(image = ?container.image, "collecting volume mounts");
        let Some(volume_mounts) = &container.volume_mounts else {
            debug!(image = ?container.image, "container has no volume mounts");
            continue;
        };
        for mount in volume_mounts {
            if !mounted_paths.insert(mount.mount_path.clone()) {
                warn!(
                    image = ?container.image,
                    mount_path = %mount.mount_path,
                    "container has overlapping mount of other container"
                );
                continue;
            }
            mounts.push(mount.clone());
        }
    }
    (volumes, mounts)
}

/// Build the temporary backup pod: same namespace as the original, labelled
/// with its name, never restarted, sleeping long enough to outlive the backup
/// and mounting the inherited volumes.
pub fn build_sidecar_pod(
    original_pod: &str,
    name: &str,
    namespace: &str,
    image: &str,
    sleep_seconds: u64,
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(ORIGINAL_POD_LABEL.to_string(), original_pod.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["/bin/sh".to_string()]),
                args: Some(vec!["-c".to_string(), format!("sleep {sleep_seconds}")]),
                volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
                ..Default::default()
            }],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        status: None,
    }
}

/// Interpret the exec error channel.
///
/// The channel closes with a `Status` object; any cause with reason
/// `ExitCode` and a non-zero code means the process failed, and a cause
/// without a reason is an unidentified error. No status at all means the
/// channel closed cleanly.
pub fn status_indicates_success(status: Option<&Status>) -> bool {
    let Some(status) = status else {
        return true;
    };
    let causes = status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref());
    for cause in causes.into_iter().flatten() {
        let Some(reason) = cause.reason.as_deref() else {
            error!(message = ?cause.message, "exec reported an error without a reason");
            return false;
        };
        if reason == "ExitCode" {
            let code = cause
                .message
                .as_deref()
                .and_then(|message| message.trim().parse::<i64>().ok())
                .unwrap_or(0);
            if code > 0 {
                error!(code, "process inside pod exited with a failure status");
                return false;
            }
        }
    }
    true
}

type BoxedOutput = Lines<BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>>;
type StatusFuture = Pin<Box<dyn Future<Output = Option<Status>> + Send + Sync>>;

/// [`ExecSession`] over a kubernetes exec attach.
///
/// The websocket transport does not carry a reliable exit code, so success is
/// judged from the error channel's closing `Status` payload.
pub struct PodExecSession {
    // Held so the attach task outlives the streams split off from it.
    _process: AttachedProcess,
    stdout: Option<BoxedOutput>,
    stderr: Option<BoxedOutput>,
    status: Option<StatusFuture>,
    outcome: Option<Status>,
    open: bool,
}

impl PodExecSession {
    pub(crate) fn from_attached(mut process: AttachedProcess) -> Self {
        let stdout = process
            .stdout()
            .map(|stream| Box::new(stream) as Box<dyn AsyncRead + Send + Sync + Unpin>)
            .map(|stream| BufReader::new(stream).lines());
        let stderr = process
            .stderr()
            .map(|stream| Box::new(stream) as Box<dyn AsyncRead + Send + Sync + Unpin>)
            .map(|stream| BufReader::new(stream).lines());
        let status = process
            .take_status()
            .map(|future| Box::pin(future) as StatusFuture);
        Self {
            _process: process,
            stdout,
            stderr,
            status,
            outcome: None,
            open: true,
        }
    }

    async fn drain(&mut self, emit: &mut (dyn FnMut(&str) + Send)) -> Result<()> {
        let mut stdout_done = self.stdout.is_none();
        let mut stderr_done = self.stderr.is_none();
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = next_line(&mut self.stdout), if !stdout_done => match line {
                    Ok(Some(line)) => emit(&line),
                    Ok(None) => stdout_done = true,
                    Err(_) => {
                        return Err(TransportError::Buffering {
                            stream: "pod exec stdout".to_string(),
                        });
                    }
                },
                line = next_line(&mut self.stderr), if !stderr_done => match line {
                    Ok(Some(line)) => emit(&line),
                    Ok(None) => stderr_done = true,
                    Err(_) => {
                        return Err(TransportError::Buffering {
                            stream: "pod exec stderr".to_string(),
                        });
                    }
                },
            }
        }
        self.finish().await;
        Ok(())
    }

    /// Resolve the error channel once the output streams are exhausted.
    async fn finish(&mut self) {
        if let Some(status) = self.status.take() {
            self.outcome = status.await;
        }
        self.open = false;
    }
}

async fn next_line(lines: &mut Option<BoxedOutput>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

#[async_trait]
impl ExecSession for PodExecSession {
    async fn read(&mut self) -> Result<String> {
        let mut output = String::new();
        self.drain(&mut |line: &str| {
            output.push_str(line);
            output.push('\n');
        })
        .await?;
        Ok(output)
    }

    async fn watch(&mut self, printer: LinePrinter<'_>) -> Result<()> {
        self.drain(&mut |line: &str| {
            if !line.is_empty() {
                printer(line);
            }
        })
        .await
    }

    fn is_running(&self) -> bool {
        self.open
    }

    async fn succeeded(&mut self) -> Result<bool> {
        if self.open {
            self.finish().await;
        }
        Ok(status_indicates_success(self.outcome.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, PodStatus},
        apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails},
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn status_with_causes(causes: Vec<StatusCause>) -> Status {
        Status {
            details: Some(StatusDetails {
                causes: Some(causes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn missing_status_counts_as_success() {
        assert!(status_indicates_success(None));
    }

    #[test]
    fn status_without_causes_counts_as_success() {
        assert!(status_indicates_success(Some(&Status::default())));
    }

    #[test]
    fn nonzero_exit_code_cause_is_a_failure() {
        let status = status_with_causes(vec![StatusCause {
            reason: Some("ExitCode".to_string()),
            message: Some("3".to_string()),
            ..Default::default()
        }]);
        assert!(!status_indicates_success(Some(&status)));
    }

    #[test]
    fn zero_exit_code_cause_is_a_success() {
        let status = status_with_causes(vec![StatusCause {
            reason: Some("ExitCode".to_string()),
            message: Some("0".to_string()),
            ..Default::default()
        }]);
        assert!(status_indicates_success(Some(&status)));
    }

    #[test]
    fn cause_without_reason_is_a_failure() {
        let status = status_with_causes(vec![StatusCause {
            reason: None,
            message: Some("websocket closed unexpectedly".to_string()),
            ..Default::default()
        }]);
        assert!(!status_indicates_success(Some(&status)));
    }

    fn pod_with_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_phase_is_ready() {
        assert!(phase_ready(&pod_with_phase("Running")));
        assert!(phase_ready(&pod_with_phase("Ready")));
        assert!(!phase_ready(&pod_with_phase("Pending")));
        assert!(!phase_ready(&Pod::default()));
    }

    fn container_status(running: bool) -> ContainerStatus {
        ContainerStatus {
            state: Some(ContainerState {
                running: running.then(ContainerStateRunning::default),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn containers_ready_requires_every_container_running() {
        let mut pod = pod_with_phase("Running");
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status(true), container_status(true)]);
        assert!(containers_ready(&pod));

        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status(true), container_status(false)]);
        assert!(!containers_ready(&pod));

        assert!(!containers_ready(&pod_with_phase("Running")));
    }

    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        }
    }

    fn pod_with_mounts(containers: Vec<Vec<VolumeMount>>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "data".to_string(),
                    ..Default::default()
                }]),
                containers: containers
                    .into_iter()
                    .enumerate()
                    .map(|(index, volume_mounts)| Container {
                        name: format!("c{index}"),
                        volume_mounts: Some(volume_mounts),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn overlapping_mounts_are_deduplicated_first_wins() {
        let pod = pod_with_mounts(vec![
            vec![mount("data", "/var/lib/data")],
            vec![mount("data-again", "/var/lib/data"), mount("logs", "/var/log")],
        ]);
        let (volumes, mounts) = inherited_volumes(&pod);

        assert_eq!(volumes.len(), 1);
        assert_eq!(
            mounts
                .iter()
                .map(|mount| (mount.name.as_str(), mount.mount_path.as_str()))
                .collect::<Vec<_>>(),
            [("data", "/var/lib/data"), ("logs", "/var/log")]
        );
    }

    #[test]
    fn pod_without_volumes_inherits_nothing() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    volume_mounts: Some(vec![mount("data", "/data")]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let (volumes, mounts) = inherited_volumes(&pod);
        assert!(volumes.is_empty());
        assert!(mounts.is_empty());
    }

    #[test]
    fn sidecar_pod_is_labelled_and_sleeps() {
        let pod = build_sidecar_pod(
            "nginx-7d9c",
            "nginx-7d9c-backup",
            "default",
            "ghcr.io/riotkit-org/backup-maker-env:latest",
            3600,
            vec![Volume {
                name: "www".to_string(),
                ..Default::default()
            }],
            vec![mount("www", "/var/www")],
        );

        assert_eq!(pod.metadata.name.as_deref(), Some("nginx-7d9c-backup"));
        assert_eq!(
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(ORIGINAL_POD_LABEL))
                .map(String::as_str),
            Some("nginx-7d9c")
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap().last().map(String::as_str),
            Some("sleep 3600")
        );
        assert_eq!(container.volume_mounts.as_ref().map(Vec::len), Some(1));
        assert_eq!(spec.volumes.as_ref().map(Vec::len), Some(1));
    }
}
