//! Host session: one connection plus the host's escalation and redaction rules

use std::sync::Arc;

use tracing::{debug, instrument};

use super::{CommandResult, Connection, RemoteCommand, Upload};
use crate::apply::variables::Redactor;
use crate::error::{ConnectionError, FactError, TaskError};

/// Everything the fact gatherer and executor need to talk to one host
#[derive(Clone)]
pub struct HostSession {
    address: String,
    conn: Arc<dyn Connection>,
    escalate: bool,
    redactor: Redactor,
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("address", &self.address)
            .field("transport", &self.conn.transport())
            .field("become", &self.escalate)
            .finish()
    }
}

fn looks_like_permission_denied(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied") || lower.contains("a password is required")
}

impl HostSession {
    pub fn new(
        address: impl Into<String>,
        conn: Arc<dyn Connection>,
        escalate: bool,
        redactor: Redactor,
    ) -> Self {
        Self {
            address: address.into(),
            conn,
            escalate,
            redactor,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Same session with escalation switched for one play
    #[must_use]
    pub fn with_become(&self, escalate: bool) -> Self {
        Self {
            escalate,
            ..self.clone()
        }
    }

    fn escalated(&self, mut command: RemoteCommand) -> RemoteCommand {
        if self.escalate {
            command.escalate = true;
        }
        command
    }

    /// Run a read-only probe; the caller interprets the exit status
    #[instrument(skip(self, words), fields(host = %self.address))]
    pub async fn probe(&self, fact: &str, words: &[&str]) -> Result<CommandResult, FactError> {
        let command = RemoteCommand::argv(words).map_err(|e| FactError::Parse {
            fact: fact.to_string(),
            message: e.to_string(),
        })?;
        let command = self.escalated(command);
        debug!(command = %self.redactor.redact(&command.to_string()), "probe");

        let result = self.conn.run(&command).await?;
        if !result.success() && looks_like_permission_denied(&result.stderr) {
            return Err(FactError::PermissionDenied {
                fact: fact.to_string(),
                message: self.redactor.redact(result.stderr.trim()),
            });
        }
        Ok(result)
    }

    /// Run a probe that must exit zero
    pub async fn probe_ok(&self, fact: &str, words: &[&str]) -> Result<CommandResult, FactError> {
        let result = self.probe(fact, words).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(FactError::Unexpected {
                command: self.redactor.redact(&words.join(" ")),
                status: result.status,
                stderr: self.redactor.redact(result.stderr.trim()),
            })
        }
    }

    /// Run a state-changing step; non-zero exit is a task failure
    #[instrument(skip(self, command), fields(host = %self.address))]
    pub async fn execute(&self, command: RemoteCommand) -> Result<CommandResult, TaskError> {
        let command = self.escalated(command);
        let shown = self.redactor.redact(&command.to_string());
        debug!(command = %shown, "execute");

        let result = self.conn.run(&command).await?;
        if !result.success() {
            return Err(TaskError::CommandFailed {
                command: shown,
                status: result.status,
                stderr: self.redactor.redact(result.stderr.trim()),
            });
        }
        Ok(result)
    }

    /// Write a file through temp-file-and-rename
    #[instrument(skip(self, upload), fields(host = %self.address, path = %upload.path))]
    pub async fn upload(&self, mut upload: Upload) -> Result<(), TaskError> {
        upload.escalate = upload.escalate || self.escalate;
        debug!(bytes = upload.content.len(), "upload");

        let result = self.conn.put(&upload).await?;
        if !result.success() {
            return Err(TaskError::CommandFailed {
                command: format!("put {}", upload.path),
                status: result.status,
                stderr: self.redactor.redact(result.stderr.trim()),
            });
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.conn.close().await
    }
}
