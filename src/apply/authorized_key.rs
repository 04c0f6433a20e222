//! SSH authorized keys management
//!
//! Ensures a public key line is present in a user's authorized_keys file.
//! Existing lines are kept in their order; the key is appended only when no
//! line matches it verbatim after trimming, so declaring one key twice still
//! leaves a single line.
//!
//! # Examples
//!
//! ## Install a CI-injected key for every account
//!
//! **YAML Format:**
//! ```yaml
//! - name: Shared deploy key
//!   type: authorized_key
//!   user: "{{ item.name }}"
//!   key: "{{ deploy_public_key }}"
//!   loop: accounts
//! ```
//!
//! **JSON Format:**
//! ```json
//! {
//!   "name": "Shared deploy key",
//!   "type": "authorized_key",
//!   "user": "dev1",
//!   "key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI... ci@deploy"
//! }
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::templating::is_templated;
use super::{default_true, validate_absolute_path, Plan};
use crate::connection::Upload;
use crate::error::TaskError;
use crate::facts::KeyFacts;

/// Authorized key task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizedKeyTask {
    /// Account that receives the key
    pub user: String,
    /// Public key line: type, base64 blob and optional comment
    pub key: String,
    /// authorized_keys path, `~/.ssh/authorized_keys` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Create the key directory when missing
    #[serde(default = "default_true")]
    pub manage_dir: bool,
}

const KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Check that a public key line is well formed
///
/// The blob must be valid base64 and must embed the same key type as the
/// leading type token.
pub fn is_valid_ssh_key(key: &str) -> bool {
    let mut parts = key.split_whitespace();
    let (Some(key_type), Some(blob)) = (parts.next(), parts.next()) else {
        return false;
    };
    if !KEY_TYPES.contains(&key_type) {
        return false;
    }
    let Ok(decoded) = STANDARD.decode(blob) else {
        return false;
    };
    if decoded.len() < 4 {
        return false;
    }
    let len = u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]);
    let Some(end) = usize::try_from(len).ok().and_then(|len| len.checked_add(4)) else {
        return false;
    };
    decoded.get(4..end) == Some(key_type.as_bytes())
}

/// Validate authorized key task parameters
pub fn validate_authorized_key_task(task: &AuthorizedKeyTask) -> Result<(), TaskError> {
    if task.user.trim().is_empty() {
        return Err(TaskError::Invalid("user cannot be empty".to_string()));
    }
    if !is_templated(&task.key) && !is_valid_ssh_key(task.key.trim()) {
        return Err(TaskError::Invalid(
            "key is not a valid SSH public key line".to_string(),
        ));
    }
    if let Some(path) = &task.path {
        validate_absolute_path("path", path)?;
    }
    Ok(())
}

/// Compute the steps that put the key in place
pub fn plan_authorized_key_task(
    task: &AuthorizedKeyTask,
    facts: &KeyFacts,
) -> Result<Plan, TaskError> {
    if !facts.user_exists {
        return Err(TaskError::Invalid(format!(
            "user '{}' does not exist",
            task.user
        )));
    }

    let wanted = task.key.trim();
    let current = facts.lines.clone().unwrap_or_default();
    let mut plan = Plan::new();
    if current.iter().any(|line| line.trim() == wanted) {
        return Ok(plan);
    }

    let group = facts.group.clone().unwrap_or_else(|| task.user.clone());
    if !facts.dir_exists {
        if !task.manage_dir {
            return Err(TaskError::Invalid(format!(
                "directory for {} does not exist and manage_dir is false",
                facts.path
            )));
        }
        let dir = facts
            .path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/");
        plan.run_argv(&[
            "install",
            "-d",
            "-m",
            "0700",
            "-o",
            task.user.as_str(),
            "-g",
            group.as_str(),
            "--",
            dir,
        ])?;
    }

    let mut content = String::new();
    for line in current.iter().chain(std::iter::once(&wanted.to_string())) {
        content.push_str(line);
        content.push('\n');
    }
    let mut upload = Upload::new(facts.path.clone(), content);
    upload.mode = Some("0600".to_string());
    upload.owner = Some(task.user.clone());
    upload.group = Some(group);
    plan.put(upload);
    Ok(plan)
}
