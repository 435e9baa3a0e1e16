//! Docker daemon access for the container transports.
//!
//! Thin helpers over [`bollard`]: pre-flight container checks, exec sessions,
//! sidecar container lifecycle and file upload. The transports own when these
//! are called; nothing here retries or cleans up on its own.

use async_trait::async_trait;
use bollard::{
    Docker, body_full,
    container::LogOutput,
    exec::StartExecResults,
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder, StartContainerOptionsBuilder,
        UploadToContainerOptionsBuilder,
    },
    secret::{ContainerCreateBody, ExecConfig, HostConfig},
};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tracing::{debug, info, instrument};

use crate::{
    error::{Result, TransportError},
    exec::{ExecSession, LinePrinter},
};

/// Connect to the local docker daemon using the ambient environment.
pub fn connect() -> Result<Docker> {
    Ok(Docker::connect_with_defaults()?)
}

/// Inspect a container, mapping a 404 to [`TransportError::ContainerNotFound`].
async fn inspect(
    docker: &Docker,
    container: &str,
) -> Result<bollard::secret::ContainerInspectResponse> {
    match docker
        .inspect_container(container, None::<InspectContainerOptions>)
        .await
    {
        Ok(response) => Ok(response),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Err(TransportError::ContainerNotFound {
            container: container.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Pre-flight check: the container exists.
pub async fn ensure_exists(docker: &Docker, container: &str) -> Result<()> {
    inspect(docker, container).await.map(drop)
}

/// Pre-flight check: the container exists and is running. A stopped container
/// is reported together with its current status.
pub async fn ensure_running(docker: &Docker, container: &str) -> Result<()> {
    let response = inspect(docker, container).await?;
    let state = response.state.unwrap_or_default();
    if state.running.unwrap_or(false) {
        return Ok(());
    }
    Err(TransportError::ContainerNotRunning {
        container: container.to_string(),
        status: state
            .status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Start `command` inside an existing container and hand back the session.
#[instrument(skip(docker, command))]
pub async fn exec(docker: &Docker, container: &str, command: Vec<String>) -> Result<DockerExecSession> {
    debug!(?command, "docker exec");
    let exec = docker
        .create_exec(
            container,
            ExecConfig {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(command),
                ..Default::default()
            },
        )
        .await?;
    match docker.start_exec(&exec.id, None).await? {
        StartExecResults::Attached { output, .. } => Ok(DockerExecSession {
            docker: docker.clone(),
            exec_id: exec.id,
            output,
            open: true,
        }),
        StartExecResults::Detached => Err(TransportError::Buffering {
            stream: "docker exec".to_string(),
        }),
    }
}

/// Pull `image` before creating containers from it.
#[instrument(skip(docker))]
pub async fn pull_image(docker: &Docker, image: &str) -> Result<()> {
    docker
        .create_image(
            Some(CreateImageOptionsBuilder::new().from_image(image).build()),
            None,
            None,
        )
        .try_collect::<Vec<_>>()
        .await?;
    Ok(())
}

/// Launch a long-sleeping container that shares the volumes of
/// `volumes_from`, in the state (rw/ro) the original container mounted them.
#[instrument(skip(docker))]
pub async fn run_sidecar_container(
    docker: &Docker,
    name: &str,
    image: &str,
    volumes_from: &str,
    sleep_seconds: u64,
) -> Result<String> {
    info!(name, image, volumes_from, "creating temporary container");
    let id = docker
        .create_container(
            Some(CreateContainerOptionsBuilder::default().name(name).build()),
            ContainerCreateBody {
                image: Some(image.to_string()),
                cmd: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("sleep {sleep_seconds}"),
                ]),
                host_config: Some(HostConfig {
                    volumes_from: Some(vec![volumes_from.to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await?
        .id;
    docker
        .start_container(&id, Some(StartContainerOptionsBuilder::default().build()))
        .await?;
    Ok(id)
}

/// Force-remove a container together with its anonymous volumes.
#[instrument(skip(docker))]
pub async fn force_remove_container(docker: &Docker, container: &str) -> Result<()> {
    info!(container, "clean up - removing temporary container");
    docker
        .remove_container(
            container,
            Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
        )
        .await?;
    Ok(())
}

/// Upload a single local file into the container at `remote_path`.
///
/// The daemon API takes a tar stream, so the file is wrapped into an
/// in-memory archive rooted at `/`.
#[instrument(skip(docker))]
pub async fn upload_file(
    docker: &Docker,
    container: &str,
    local_path: &str,
    remote_path: &str,
) -> Result<()> {
    let content = tokio::fs::read(local_path)
        .await
        .map_err(|err| TransportError::filesystem("copy", local_path, err))?;

    let mut header = async_tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();
    let mut builder = async_tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, remote_path.trim_start_matches('/'), content.as_slice())
        .await
        .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;
    let archive = builder
        .into_inner()
        .await
        .map_err(|err| TransportError::filesystem("copy", remote_path, err))?;

    docker
        .upload_to_container(
            container,
            Some(UploadToContainerOptionsBuilder::default().path("/").build()),
            body_full(archive.into()),
        )
        .await?;
    Ok(())
}

/// [`ExecSession`] over a `docker exec` output stream.
///
/// Exit codes come from `inspect_exec`, which the daemon reports reliably.
pub struct DockerExecSession {
    docker: Docker,
    exec_id: String,
    output: BoxStream<'static, std::result::Result<LogOutput, bollard::errors::Error>>,
    open: bool,
}

impl DockerExecSession {
    async fn drain(&mut self, emit: &mut (dyn FnMut(&str) + Send)) -> Result<()> {
        let mut stdout_rest = String::new();
        let mut stderr_rest = String::new();
        while let Some(chunk) = self.output.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    emit_lines(&mut stdout_rest, &message, emit);
                }
                LogOutput::StdErr { message } => {
                    emit_lines(&mut stderr_rest, &message, emit);
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        for rest in [stdout_rest, stderr_rest] {
            if !rest.is_empty() {
                emit(&rest);
            }
        }
        self.open = false;
        Ok(())
    }
}

#[async_trait]
impl ExecSession for DockerExecSession {
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
        let inspection = self.docker.inspect_exec(&self.exec_id).await?;
        Ok(inspection.exit_code.unwrap_or_default() == 0)
    }
}

/// Append a raw chunk to `buffer` and emit every completed line.
fn emit_lines(buffer: &mut String, chunk: &[u8], emit: &mut (dyn FnMut(&str) + Send)) {
    buffer.push_str(&String::from_utf8_lossy(chunk));
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim_end_matches('\n');
        if !line.is_empty() {
            emit(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn emit_lines_splits_on_newlines_across_chunks() {
        let mut buffer = String::new();
        let mut lines = Vec::new();
        let mut emit = |line: &str| lines.push(line.to_string());

        emit_lines(&mut buffer, b"first\nsec", &mut emit);
        emit_lines(&mut buffer, b"ond\n", &mut emit);

        assert_eq!(lines, ["first", "second"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn emit_lines_keeps_trailing_partial_line() {
        let mut buffer = String::new();
        let mut lines = Vec::new();
        let mut emit = |line: &str| lines.push(line.to_string());

        emit_lines(&mut buffer, b"no newline yet", &mut emit);

        assert!(lines.is_empty());
        assert_eq!(buffer, "no newline yet");
    }
}
