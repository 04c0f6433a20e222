//! Error taxonomy
//!
//! Configuration problems are detected before any host is contacted and are
//! fatal to the whole run. Connection, fact, template and task errors are
//! scoped to one host or one task and end up in the run report.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems in declarations, inventory or variables
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A declaration file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A declaration file could not be parsed
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A required variable resolved to nothing for a host
    #[error("host {host}: required variable '{name}' is not defined and has no default")]
    MissingVariable { host: String, name: String },

    /// An injected value does not have the declared shape
    #[error("injected variable '{name}': {message}")]
    InvalidInjected { name: String, message: String },

    /// A credential is stored as a literal value
    #[error("variable '{name}' in {layer} holds a plaintext credential; inject it at run time instead")]
    PlaintextCredential { name: String, layer: String },

    /// A play or `--limit` names a group the inventory does not define
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// A group lists a host the inventory does not define
    #[error("group '{group}' references unknown host '{host}'")]
    UnknownHost { group: String, host: String },

    /// A task declaration failed validation
    #[error("play '{play}', task {index} ('{task}'): {message}")]
    InvalidTask {
        play: String,
        index: usize,
        task: String,
        message: String,
    },

    /// Anything else that makes the run impossible
    #[error("{0}")]
    Invalid(String),
}

/// Failures of the transport to a host
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The host rejected our credential
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The round-trip exceeded its budget
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The private key could not be loaded
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error on the local transport
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error on an established channel
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,
}

impl ConnectionError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::Timeout { .. }
                | ConnectionError::IoError(_)
        )
    }
}

/// Failures while probing remote state
#[derive(Error, Debug)]
pub enum FactError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The probe was refused by the host
    #[error("permission denied while gathering {fact}: {message}")]
    PermissionDenied { fact: String, message: String },

    /// The probe exited with a status that has no meaning for the fact
    #[error("'{command}' exited with status {status}: {stderr}")]
    Unexpected {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The probe output could not be interpreted
    #[error("could not parse {fact}: {message}")]
    Parse { fact: String, message: String },
}

/// Failures of the template renderer
#[derive(Error, Debug)]
pub enum TemplateError {
    /// A referenced variable is undefined and has no default
    #[error("template '{template}': undefined variable: {detail}")]
    Undefined { template: String, detail: String },

    /// The template source is malformed
    #[error("template '{template}': syntax error: {detail}")]
    Syntax { template: String, detail: String },

    /// Any other rendering failure
    #[error("template '{template}': {detail}")]
    Render { template: String, detail: String },

    /// The template source could not be read
    #[error("failed to read template {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl TemplateError {
    pub(crate) fn from_minijinja(template: &str, err: &minijinja::Error) -> Self {
        let detail = match err.detail() {
            Some(detail) => detail.to_string(),
            None => err.kind().to_string(),
        };
        let template = template.to_string();
        match err.kind() {
            minijinja::ErrorKind::UndefinedError => TemplateError::Undefined { template, detail },
            minijinja::ErrorKind::SyntaxError => TemplateError::Syntax { template, detail },
            _ => TemplateError::Render { template, detail },
        }
    }
}

/// Failures while reconciling one task
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Fact(#[from] FactError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A remote step exited non-zero
    #[error("'{command}' failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The declaration cannot be applied as written
    #[error("{0}")]
    Invalid(String),
}

impl From<shlex::QuoteError> for TaskError {
    fn from(err: shlex::QuoteError) -> Self {
        TaskError::Invalid(format!("cannot quote command argument: {err}"))
    }
}
