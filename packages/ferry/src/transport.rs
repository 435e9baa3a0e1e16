//! Transports: running a backup command inside a target execution
//! environment.
//!
//! A transport serves one session at a time, as a strictly sequential flow:
//! `prepare_environment` → `schedule` → `watch` → `release`. Callers drive
//! that flow through [`ScopedSession`], which guarantees that `release` runs
//! on every exit path (success, error or panic) so that temporary pods,
//! containers and scaled-down controllers never outlive the session.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{error, instrument};

use crate::{
    binaries::{RequiredBinary, default_backup_maker_binaries},
    command::Operation,
    definition::BackupDefinition,
    error::{Result, TransportError},
};

mod docker;
mod docker_sidecar;
mod pod_exec;
mod shell;
mod sidecar_pod;

pub use docker::DockerExecTransport;
pub use docker_sidecar::DockerSidecarTransport;
pub use pod_exec::PodExecTransport;
pub use shell::ShellTransport;
pub use sidecar_pod::SidecarPodTransport;

/// Capability contract every target execution environment implements.
#[async_trait]
pub trait Transport: Send {
    /// Stage the required helper binaries into the local cache and perform
    /// target pre-flight checks. Must run before [`Transport::schedule`].
    async fn prepare_environment(&mut self, binaries: Vec<RequiredBinary>) -> Result<()>;

    /// Stage dependencies into the target environment and start the backup
    /// process there.
    async fn schedule(
        &mut self,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<()>;

    /// Stream the scheduled process to the debug log until it exits; report
    /// whether it succeeded.
    async fn watch(&mut self) -> Result<bool>;

    /// Tear down everything the session created in the target environment.
    /// Idempotent; a failing step never prevents the remaining steps.
    async fn release(&mut self) -> Result<()>;

    /// The helpers this transport needs staged on top of whatever the caller
    /// requests.
    fn required_binaries(&self) -> Vec<RequiredBinary> {
        default_backup_maker_binaries()
    }
}

/// Parse a transport specification fragment.
///
/// Unknown keys are tolerated for forward compatibility; missing required
/// keys surface as a configuration error.
pub(crate) fn parse_spec<T: DeserializeOwned>(spec: &serde_json::Value) -> Result<T> {
    serde_json::from_value(spec.clone())
        .map_err(|err| TransportError::configuration(err.to_string()))
}

/// Scoped use of a transport: drives the session flow and releases the
/// transport on every exit path.
pub struct ScopedSession<'a> {
    transport: &'a mut dyn Transport,
}

impl<'a> ScopedSession<'a> {
    pub fn new(transport: &'a mut dyn Transport) -> Self {
        Self { transport }
    }

    /// Run a full session: prepare, schedule, watch to completion, release.
    ///
    /// Returns whether the backup process succeeded. `release` runs whether
    /// the flow succeeds, errors or panics; a release failure is logged and
    /// never masks the error that preceded it.
    #[instrument(skip_all, fields(definition = definition.name()))]
    pub async fn run(
        &mut self,
        binaries: Vec<RequiredBinary>,
        command: &str,
        definition: &BackupDefinition,
        operation: Operation,
        version: &str,
    ) -> Result<bool> {
        let outcome = AssertUnwindSafe(async {
            self.transport.prepare_environment(binaries).await?;
            self.transport
                .schedule(command, definition, operation, version)
                .await?;
            self.transport.watch().await
        })
        .catch_unwind()
        .await;

        let released = self.transport.release().await;

        match outcome {
            Err(panic) => {
                if let Err(err) = released {
                    error!(error = %err, "release failed while unwinding");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => {
                if let Err(release_err) = released {
                    error!(error = %release_err, "release failed after an earlier error");
                }
                Err(err)
            }
            Ok(Ok(success)) => {
                released?;
                Ok(success)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::definition::{Encryption, ServerAccess};

    fn example_definition() -> BackupDefinition {
        BackupDefinition::new(
            "fs",
            ServerAccess::new("http://localhost:8080", "test"),
            "1111-2222-3333-4444",
            Encryption::default(),
        )
    }

    #[derive(Copy, Clone)]
    enum Behaviour {
        Succeed,
        FailSchedule,
        FailScheduleAndRelease,
        PanicDuringSchedule,
    }

    struct StubTransport {
        behaviour: Behaviour,
        released: Arc<AtomicBool>,
        release_count: Arc<AtomicUsize>,
    }

    impl StubTransport {
        fn new(behaviour: Behaviour, released: Arc<AtomicBool>) -> Self {
            Self {
                behaviour,
                released,
                release_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn prepare_environment(&mut self, _binaries: Vec<RequiredBinary>) -> Result<()> {
            Ok(())
        }

        async fn schedule(
            &mut self,
            _command: &str,
            _definition: &BackupDefinition,
            _operation: Operation,
            _version: &str,
        ) -> Result<()> {
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::FailSchedule | Behaviour::FailScheduleAndRelease => {
                    Err(TransportError::Exec {
                        output: "scheduling failed".to_string(),
                    })
                }
                Behaviour::PanicDuringSchedule => panic!("boom"),
            }
        }

        async fn watch(&mut self) -> Result<bool> {
            Ok(true)
        }

        async fn release(&mut self) -> Result<()> {
            self.released.store(true, Ordering::SeqCst);
            self.release_count.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::FailScheduleAndRelease => Err(TransportError::Exec {
                    output: "release failed".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    async fn run_session(transport: &mut StubTransport) -> Result<bool> {
        ScopedSession::new(transport)
            .run(
                Vec::new(),
                "--mocked--",
                &example_definition(),
                Operation::Backup,
                "",
            )
            .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_runs_after_a_successful_session() {
        let released = Arc::new(AtomicBool::new(false));
        let mut transport = StubTransport::new(Behaviour::Succeed, released.clone());

        assert!(run_session(&mut transport).await.unwrap());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_runs_after_a_scheduling_error() {
        let released = Arc::new(AtomicBool::new(false));
        let mut transport = StubTransport::new(Behaviour::FailSchedule, released.clone());

        let err = run_session(&mut transport).await.unwrap_err();
        assert!(matches!(err, TransportError::Exec { .. }));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_errors_never_mask_the_original_error() {
        let released = Arc::new(AtomicBool::new(false));
        let mut transport =
            StubTransport::new(Behaviour::FailScheduleAndRelease, released.clone());

        let err = run_session(&mut transport).await.unwrap_err();
        assert!(err.to_string().contains("scheduling failed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_runs_even_when_the_session_panics() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let outcome = tokio::spawn(async move {
            let mut transport = StubTransport::new(Behaviour::PanicDuringSchedule, flag);
            run_session(&mut transport).await
        })
        .await;

        assert!(outcome.is_err(), "the panic must propagate out of the session");
        assert!(released.load(Ordering::SeqCst));
    }
}
