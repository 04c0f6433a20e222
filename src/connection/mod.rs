//! Connection layer
//!
//! Authenticated command and file-transfer channels to target hosts. The
//! [`Connection`] trait is the seam every higher layer talks through; SSH and
//! local transports implement it, and [`retry::ResilientConnection`] wraps
//! either with per-operation timeouts and bounded retries.

pub mod keys;
pub mod local;
pub mod retry;
pub mod session;
pub mod ssh;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::inventory::{Host, Transport};

pub use retry::{ResilientConnection, RetryPolicy};
pub use session::HostSession;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Where and as whom to log in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// A command line to run on a host, with optional stdin and privilege escalation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Shell-quoted command line
    pub line: String,
    /// Bytes fed to the command's stdin
    pub stdin: Option<Vec<u8>>,
    /// Run through `sudo`
    pub escalate: bool,
    /// Target user for `sudo -u`
    pub become_user: Option<String>,
    /// Environment assignments prefixed with `env`
    pub env: Vec<(String, String)>,
}

impl RemoteCommand {
    /// Build a command from a raw shell line
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            ..Self::default()
        }
    }

    /// Build a command from words, quoting each one
    pub fn argv(words: &[&str]) -> Result<Self, shlex::QuoteError> {
        Ok(Self::shell(shlex::try_join(words.iter().copied())?))
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    #[must_use]
    pub fn with_become(mut self, escalate: bool) -> Self {
        self.escalate = escalate;
        self
    }

    #[must_use]
    pub fn with_become_user(mut self, user: Option<String>) -> Self {
        if user.is_some() {
            self.escalate = true;
        }
        self.become_user = user;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The line a POSIX shell on the host should execute
    pub fn to_shell_line(&self) -> Result<String, shlex::QuoteError> {
        let mut line = String::new();
        if !self.env.is_empty() {
            line.push_str("env ");
            for (key, value) in &self.env {
                line.push_str(key);
                line.push('=');
                line.push_str(&shlex::try_quote(value)?);
                line.push(' ');
            }
        }
        line.push_str(&self.line);

        if !self.escalate {
            return Ok(line);
        }

        let mut words = vec!["sudo", "-n"];
        if let Some(user) = &self.become_user {
            words.extend(["-u", user.as_str(), "-H"]);
        }
        words.extend(["sh", "-c", line.as_str()]);
        shlex::try_join(words)
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.escalate {
            write!(f, "[sudo] ")?;
        }
        write!(f, "{}", self.line)
    }
}

/// A file to place on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub content: Vec<u8>,
    pub path: String,
    /// Octal mode such as `0644`; existing mode (or 0644) when unset
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub escalate: bool,
}

impl Upload {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            path: path.into(),
            mode: None,
            owner: None,
            group: None,
            escalate: false,
        }
    }

    fn ownership(&self) -> String {
        match (&self.owner, &self.group) {
            (Some(owner), Some(group)) => format!("{owner}:{group}"),
            (Some(owner), None) => owner.clone(),
            (None, Some(group)) => format!(":{group}"),
            (None, None) => String::new(),
        }
    }
}

/// Writes stdin to a temp file next to the destination and renames it into place
const UPLOAD_SCRIPT: &str = r#"set -e
dest=$1
tmp=$(mktemp "$(dirname -- "$dest")/.fleetplay.XXXXXX")
trap 'rm -f -- "$tmp"' EXIT
cat > "$tmp"
if [ -n "$2" ]; then chmod "$2" "$tmp"
elif [ -e "$dest" ]; then chmod --reference="$dest" "$tmp"
else chmod 0644 "$tmp"; fi
if [ -n "$3" ]; then chown "$3" "$tmp"; fi
mv -f -- "$tmp" "$dest"
trap - EXIT"#;

/// Build the command that performs an upload over a plain command channel
pub fn upload_command(upload: &Upload) -> Result<RemoteCommand, shlex::QuoteError> {
    let mode = upload.mode.clone().unwrap_or_default();
    let ownership = upload.ownership();
    let command = RemoteCommand::argv(&[
        "sh",
        "-c",
        UPLOAD_SCRIPT,
        "fleetplay-put",
        upload.path.as_str(),
        mode.as_str(),
        ownership.as_str(),
    ])?;
    Ok(command
        .with_stdin(upload.content.clone())
        .with_become(upload.escalate))
}

/// An established channel to one host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a command and collect its exit status and output
    async fn run(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError>;

    /// Place a file on the host; a non-zero status means the write was refused
    async fn put(&self, upload: &Upload) -> Result<CommandResult, ConnectionError> {
        let command =
            upload_command(upload).map_err(|e| ConnectionError::IoError(e.to_string()))?;
        self.run(&command).await
    }

    /// Transport name for logs
    fn transport(&self) -> &'static str;

    /// Release the channel
    async fn close(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Timeouts and retry budget shared by every transport
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Opens connections to inventory hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConnectionError>;
}

/// Connector that picks SSH or local transport from the host's declaration
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    settings: ConnectionSettings,
}

impl TransportConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConnectionError> {
        let inner: Arc<dyn Connection> = match host.transport {
            Transport::Local => Arc::new(local::LocalConnection::new()),
            Transport::Ssh => {
                let key = keys::KeySource::for_host(host)?;
                let ssh = ssh::SshConnection::new(host.connection_info(), &key)?;
                let policy = &self.settings.retry;
                let connect_timeout = self.settings.connect_timeout;
                retry::with_retry(policy, "connect", || async {
                    match tokio::time::timeout(connect_timeout, ssh.connect()).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectionError::Timeout {
                            timeout: connect_timeout,
                        }),
                    }
                })
                .await?;
                Arc::new(ssh)
            }
        };
        Ok(Arc::new(ResilientConnection::new(
            inner,
            self.settings.retry.clone(),
            self.settings.command_timeout,
        )))
    }
}
