//! SSH transport using the russh client

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{client, ChannelMsg, Disconnect};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::keys::{KeySource, ResolvedKey};
use super::{CommandResult, Connection, ConnectionInfo, RemoteCommand};
use crate::error::ConnectionError;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        warn!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(Default::default()),
            "accepting server host key without verification"
        );
        Ok(true)
    }
}

/// One authenticated SSH session per host, opened on first use
pub struct SshConnection {
    conn_info: ConnectionInfo,
    key: ResolvedKey,
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("conn_info", &self.conn_info)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Create a connection; the key is resolved now, the session lazily
    pub fn new(conn_info: ConnectionInfo, key_source: &KeySource) -> Result<Self, ConnectionError> {
        let key = key_source.resolve()?;
        Ok(Self {
            conn_info,
            key,
            session: Mutex::new(None),
        })
    }

    /// Connect and authenticate unless a session is already open
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut session_lock = self.session.lock().await;
        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: self.conn_info.host.clone(),
        };

        let mut session = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            handler,
        )
        .await
        .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        let key_pair = load_secret_key(self.key.path(), None)
            .map_err(|e| ConnectionError::SshKeyError(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "public key rejected for {}@{}",
                self.conn_info.user, self.conn_info.host
            )));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");
        *session_lock = Some(session);
        Ok(())
    }

    async fn execute_remote(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError> {
        let line = command
            .to_shell_line()
            .map_err(|e| ConnectionError::IoError(e.to_string()))?;

        let mut session_lock = self.session.lock().await;
        let session = session_lock.as_mut().ok_or(ConnectionError::NotConnected)?;

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::IoError(e.to_string()))?;

        channel
            .exec(true, line.as_str())
            .await
            .map_err(|e| ConnectionError::IoError(e.to_string()))?;

        if let Some(stdin) = &command.stdin {
            channel
                .data(&stdin[..])
                .await
                .map_err(|e| ConnectionError::IoError(e.to_string()))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| ConnectionError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // exit-status may arrive after EOF, so drain until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    status = i32::try_from(exit_status).unwrap_or(-1);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        debug!(status, duration = ?duration, "remote command completed");

        Ok(CommandResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration,
        })
    }
}

#[async_trait]
impl Connection for SshConnection {
    #[instrument(skip(self, command), fields(host = %self.conn_info.host))]
    async fn run(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError> {
        self.connect().await?;
        let result = self.execute_remote(command).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                // drop the session so a retry reconnects
                self.session.lock().await.take();
            }
        }
        result
    }

    fn transport(&self) -> &'static str {
        "ssh"
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut session_lock = self.session.lock().await;
        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ConnectionError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}
