//! Local transport using `tokio::process`

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{CommandResult, Connection, RemoteCommand};
use crate::error::ConnectionError;

/// Runs commands on the control node itself
#[derive(Debug, Clone, Default)]
pub struct LocalConnection;

impl LocalConnection {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connection for LocalConnection {
    #[instrument(skip(self, command), level = "debug")]
    async fn run(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError> {
        let line = command
            .to_shell_line()
            .map_err(|e| ConnectionError::SpawnError(e.to_string()))?;
        let start = Instant::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectionError::SpawnError(e.to_string()))?;

        let pipe = child.stdin.take();
        // the pipe is dropped, signalling EOF, once the whole input is written
        let feed = async {
            let (Some(bytes), Some(mut pipe)) = (&command.stdin, pipe) else {
                return Ok(());
            };
            match pipe.write_all(bytes).await {
                // the child exited without reading everything; its status decides
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| ConnectionError::IoError(e.to_string()))?;
        fed.map_err(|e| ConnectionError::IoError(e.to_string()))?;

        let duration = start.elapsed();
        let status = output.status.code().unwrap_or(-1);
        debug!(status, duration = ?duration, "local command completed");

        Ok(CommandResult {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }

    fn transport(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Upload;

    #[tokio::test]
    async fn test_run_success() {
        let conn = LocalConnection::new();
        let result = conn.run(&RemoteCommand::shell("echo hello")).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let conn = LocalConnection::new();
        let result = conn.run(&RemoteCommand::shell("exit 42")).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let conn = LocalConnection::new();
        let result = conn
            .run(&RemoteCommand::shell("echo error >&2"))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stderr.trim(), "error");
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let conn = LocalConnection::new();
        let cmd = RemoteCommand::shell("tr a-z A-Z").with_stdin("shout\n");
        let result = conn.run(&cmd).await.unwrap();
        assert_eq!(result.stdout, "SHOUT\n");
    }

    #[tokio::test]
    async fn test_large_stdin_is_streamed_while_reading_output() {
        let input = vec![b'x'; 1 << 20];
        let cmd = RemoteCommand::shell("cat").with_stdin(input.clone());
        let result = LocalConnection::new().run(&cmd).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn test_early_exit_reports_status_not_io_error() {
        let cmd = RemoteCommand::shell("exit 3").with_stdin(vec![b'x'; 1 << 20]);
        let result = LocalConnection::new().run(&cmd).await.unwrap();
        assert_eq!(result.status, 3);
    }

    #[tokio::test]
    async fn test_put_replaces_file_atomically() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.env");
        std::fs::write(&dest, "OLD=1\n").unwrap();

        let mut upload = Upload::new(dest.to_string_lossy(), "NEW=1\n");
        upload.mode = Some("0640".to_string());
        let result = LocalConnection::new().put(&upload).await.unwrap();
        assert!(result.success(), "{}", result.stderr);

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "NEW=1\n");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_put_into_missing_directory_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing/app.env");
        let upload = Upload::new(dest.to_string_lossy(), "X=1\n");
        let result = LocalConnection::new().put(&upload).await.unwrap();
        assert!(!result.success());
        assert!(!dest.exists());
    }
}
