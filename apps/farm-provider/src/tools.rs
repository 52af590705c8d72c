//! Thin wrappers over the external CLIs (`adb`, `ios`, `appium`, `java`).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_appender::non_blocking::NonBlocking;

use crate::logging::write_line;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} {args} timed out after {timeout:?}")]
    Timeout {
        program: String,
        args: String,
        timeout: Duration,
    },
    #[error("{program} {args} failed ({status}): {stderr}")]
    Failed {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },
}

/// A configured CLI binary.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs to completion and returns trimmed stdout. Non-zero exit is an error.
    pub async fn run<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<String, ToolError> {
        let stdout = self.run_raw(args, timeout).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Like [`Tool::run`] but keeps stdout as raw bytes (screenshots).
    pub async fn run_raw<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<Vec<u8>, ToolError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let joined = args.join(" ");
        debug!(program = %self.program, args = %joined, "running tool");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    program: self.program.clone(),
                    args: joined,
                    timeout,
                })
            }
        };
        if !output.status.success() {
            return Err(ToolError::Failed {
                program: self.program.clone(),
                args: joined,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// A long-running child bound to a device's cancellation scope.
pub struct ServiceSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub log: NonBlocking,
}

/// Spawns the service and supervises it until the scope is cancelled.
/// `on_exit` runs only when the child stops on its own.
pub fn spawn_service<F>(
    spec: ServiceSpec,
    scope: CancellationToken,
    on_exit: F,
) -> Result<JoinHandle<()>, ToolError>
where
    F: FnOnce(String) + Send + 'static,
{
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    write_line(
        &spec.log,
        &spec.name,
        &format!("started {} {}", spec.program, spec.args.join(" ")),
    );

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_child_lines(out, spec.log.clone(), spec.name.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_child_lines(err, spec.log.clone(), spec.name.clone())));

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = scope.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(service = %spec.name, error = %err, "failed to kill service");
                }
                let _ = child.wait().await;
                write_line(&spec.log, &spec.name, "stopped");
            }
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("{} exited: {status}", spec.name),
                    Err(err) => format!("{} wait failed: {err}", spec.name),
                };
                write_line(&spec.log, &spec.name, &reason);
                if !scope.is_cancelled() {
                    on_exit(reason);
                }
            }
        }
        for task in [stdout, stderr].into_iter().flatten() {
            task.abort();
        }
    }))
}

async fn forward_child_lines<R>(stream: R, log: NonBlocking, source: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if !trimmed.is_empty() {
                    write_line(&log, &source, trimmed);
                }
            }
            Err(err) => {
                warn!(source = %source, error = %err, "failed to read service output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn missing_binary_is_a_spawn_error() {
        let tool = Tool::new("farm-definitely-not-installed");
        let err = tool.run(&["devices"], Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn captures_stdout_and_failures() {
        let sh = Tool::new("sh");
        let out = sh
            .run(&["-c", "echo '  ready  '"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "ready");

        let err = sh
            .run(&["-c", "echo boom >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn slow_tool_times_out() {
        let err = Tool::new("sh")
            .run(&["-c", "sleep 5"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn unexpected_exit_reports_but_cancel_does_not() {
        let dir = std::env::temp_dir().join(format!("farm-tools-{}", std::process::id()));
        let logs = crate::logging::DeviceLogs::open(&dir).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = spawn_service(
            ServiceSpec {
                name: "short".into(),
                program: "sh".into(),
                args: vec!["-c".into(), "echo hi; exit 1".into()],
                log: logs.device.clone(),
            },
            CancellationToken::new(),
            move |reason| {
                let _ = tx.send(reason);
            },
        )
        .unwrap();
        let reason = rx.await.unwrap();
        assert!(reason.starts_with("short exited"));
        handle.await.unwrap();

        let scope = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::oneshot::channel::<String>();
        let handle = spawn_service(
            ServiceSpec {
                name: "long".into(),
                program: "sh".into(),
                args: vec!["-c".into(), "sleep 30".into()],
                log: logs.device.clone(),
            },
            scope.clone(),
            move |reason| {
                let _ = tx.send(reason);
            },
        )
        .unwrap();
        scope.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
