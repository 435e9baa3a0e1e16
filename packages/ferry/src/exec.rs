//! Exec sessions: opaque handles over processes running in a target
//! environment.
//!
//! Every transport schedules exactly one process per session and then either
//! collects its output with [`ExecSession::read`] or streams it line by line
//! with [`ExecSession::watch`]. Sessions reach a sticky terminal state once
//! their output channels close; only then is [`ExecSession::succeeded`]
//! meaningful.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdout, Command},
};
use tracing::instrument;

use crate::error::{Result, TransportError};

/// Sink for output lines produced by [`ExecSession::watch`].
pub type LinePrinter<'a> = &'a mut (dyn FnMut(&str) + Send);

/// A running process inside a target environment.
///
/// Lines are delivered in the order they were read from each stream; the
/// interleaving between stdout and stderr is not defined, but no line is ever
/// dropped.
#[async_trait]
pub trait ExecSession: Send {
    /// Block until the process exits, returning everything it wrote.
    async fn read(&mut self) -> Result<String>;

    /// Stream non-empty output lines through `printer` until the session
    /// closes.
    async fn watch(&mut self, printer: LinePrinter<'_>) -> Result<()>;

    /// Whether the underlying output channels are still open.
    fn is_running(&self) -> bool;

    /// Whether the process exited cleanly. Only defined once the session is
    /// no longer running.
    async fn succeeded(&mut self) -> Result<bool>;
}

/// [`ExecSession`] over a local subprocess.
pub struct LocalSession {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
    status: Option<ExitStatus>,
}

impl LocalSession {
    /// Spawn `command_line` through the configured shell, capturing both
    /// output streams.
    #[instrument]
    pub fn spawn(shell: &str, command_line: &str) -> Result<Self> {
        let mut child = Command::new(shell)
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Buffering {
            stream: "stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TransportError::Buffering {
            stream: "stderr".to_string(),
        })?;
        Ok(Self {
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
            status: None,
        })
    }

    /// Drain both output streams, feeding every line to `emit`, then record
    /// the exit status.
    async fn drain(&mut self, emit: &mut (dyn FnMut(&str) + Send)) -> Result<()> {
        let mut stdout_done = false;
        let mut stderr_done = false;
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = self.stdout.next_line(), if !stdout_done => match line {
                    Ok(Some(line)) => emit(&line),
                    Ok(None) => stdout_done = true,
                    Err(_) => {
                        return Err(TransportError::Buffering {
                            stream: "stdout".to_string(),
                        });
                    }
                },
                line = self.stderr.next_line(), if !stderr_done => match line {
                    Ok(Some(line)) => emit(&line),
                    Ok(None) => stderr_done = true,
                    Err(_) => {
                        return Err(TransportError::Buffering {
                            stream: "stderr".to_string(),
                        });
                    }
                },
            }
        }
        if self.status.is_none() {
            self.status = Some(self.child.wait().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecSession for LocalSession {
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
        self.status.is_none()
    }

    async fn succeeded(&mut self) -> Result<bool> {
        if self.status.is_none() {
            self.status = Some(self.child.wait().await?);
        }
        Ok(self.status.is_some_and(|status| status.success()))
    }
}

/// Quote `argument` for POSIX `sh`.
pub(crate) fn shell_quote(argument: &str) -> String {
    if !argument.is_empty()
        && argument
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        return argument.to_string();
    }
    format!("'{}'", argument.replace('\'', "'\\''"))
}

/// Join an argv into one `sh -c` compatible command line.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|argument| shell_quote(argument))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_preserves_order_within_a_stream() {
        let mut session = LocalSession::spawn("/bin/sh", "echo one; echo two; echo three").unwrap();
        let mut lines = Vec::new();
        session.watch(&mut |line: &str| lines.push(line.to_string())).await.unwrap();

        assert_eq!(lines, ["one", "two", "three"]);
        assert!(!session.is_running());
        assert!(session.succeeded().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_captures_both_streams() {
        let mut session =
            LocalSession::spawn("/bin/sh", "echo out; echo err 1>&2").unwrap();
        let mut lines = Vec::new();
        session.watch(&mut |line: &str| lines.push(line.to_string())).await.unwrap();

        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"err".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_collects_output_and_failure_is_reported() {
        let mut session = LocalSession::spawn("/bin/sh", "echo gone; exit 3").unwrap();
        let output = session.read().await.unwrap();

        assert!(output.contains("gone"));
        assert!(!session.succeeded().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_command_reports_failure() {
        let mut session = LocalSession::spawn("/bin/sh", "some-not-existing-command").unwrap();
        let output = session.read().await.unwrap();

        assert!(!session.succeeded().await.unwrap());
        assert!(output.contains("not found") || output.contains("No such file"));
    }

    #[test]
    fn quoting_keeps_plain_arguments_readable() {
        assert_eq!(shell_quote("/bin/ls"), "/bin/ls");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(
            shell_join(&["test".to_string(), "-d".to_string(), "/some dir".to_string()]),
            "test -d '/some dir'"
        );
    }
}
