//! SSH key resolution
//!
//! A host authenticates either with a key file on the control node or with a
//! base64-encoded key carried in an environment variable, which is how CI
//! secret stores hand keys over. The latter is materialised into a private
//! temp file that lives exactly as long as the resolved key.

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::ConnectionError;
use crate::inventory::Host;

/// SSH key resolution strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Pick the key source declared for a host; the env source wins over a path
    pub fn for_host(host: &Host) -> Result<Self, ConnectionError> {
        if let Some(var) = &host.private_key_env {
            return Ok(KeySource::Env(var.clone()));
        }
        match &host.private_key {
            Some(path) => Ok(KeySource::Path(expand_home(path))),
            None => Err(ConnectionError::SshKeyError(format!(
                "no private key declared for {}",
                host.address
            ))),
        }
    }

    /// Check the source is usable without materialising anything
    pub fn check(&self) -> Result<(), ConnectionError> {
        match self {
            KeySource::Path(path) => validate_key_permissions(path),
            KeySource::Env(var) => match env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(()),
                _ => Err(ConnectionError::SshKeyError(format!(
                    "environment variable {var} not set"
                ))),
            },
        }
    }

    /// Resolve to a key file on disk
    pub fn resolve(&self) -> Result<ResolvedKey, ConnectionError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::Env(var) => {
                let encoded = env::var(var).map_err(|_| {
                    ConnectionError::SshKeyError(format!("environment variable {var} not set"))
                })?;
                let key_data = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| {
                        ConnectionError::SshKeyError(format!(
                            "environment variable {var} is not valid base64"
                        ))
                    })?;
                Ok(ResolvedKey::Temp(write_temp_key(&key_data)?))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    Path(PathBuf),
    /// Removed from disk on drop
    Temp(NamedTempFile),
}

impl ResolvedKey {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ResolvedKey::Path(path) => path,
            ResolvedKey::Temp(file) => file.path(),
        }
    }
}

/// Expand a leading `~/` against the control node's home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn validate_key_permissions(path: &Path) -> Result<(), ConnectionError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        ConnectionError::SshKeyError(format!("key file {}: {e}", path.display()))
    })?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(ConnectionError::SshKeyError(format!(
            "key file permissions too open: {} (should be 600)",
            path.display()
        )));
    }
    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<NamedTempFile, ConnectionError> {
    use std::os::unix::fs::PermissionsExt;

    let io_err = |e: std::io::Error| ConnectionError::SshKeyError(e.to_string());

    let mut file = tempfile::Builder::new()
        .prefix("fleetplay-key-")
        .tempfile()
        .map_err(io_err)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(io_err)?;
    file.write_all(key_data).map_err(io_err)?;
    file.flush().map_err(io_err)?;

    debug!(path = %file.path().display(), "wrote temporary SSH key");
    Ok(file)
}
