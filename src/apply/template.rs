//! Template deploy task
//!
//! Renders a template against the host's variables, compares the SHA-256 of
//! the result with the destination file and uploads only on a difference.
//! Declared `mode`, `owner` and `group` are enforced separately, so
//! metadata-only drift is fixed with `chmod`/`chown` and no upload.
//!
//! # Examples
//!
//! ## Environment file from injected secrets
//!
//! **YAML Format:**
//! ```yaml
//! - name: App environment
//!   type: template
//!   src: templates/app.env.j2
//!   dest: /srv/app/.env
//!   mode: "0600"
//!   owner: nodeapp
//!   notify: [restart app]
//! ```
//!
//! ## Inline content
//!
//! **YAML Format:**
//! ```yaml
//! - type: template
//!   content: "Managed by fleetplay for {{ inventory_hostname }}\n"
//!   dest: /etc/motd
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use super::templating::is_templated;
use super::{normalize_mode, validate_absolute_path, Plan};
use crate::connection::Upload;
use crate::error::TaskError;
use crate::facts::FileFacts;
use crate::inventory::injected::is_valid_username;

/// Template deploy task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateTask {
    /// Template file, relative to the playbook directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Inline template source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Destination path on the host
    pub dest: String,
    /// Octal mode; `0644`, `"0644"` and `644` are equivalent
    #[serde(
        default,
        deserialize_with = "deserialize_mode",
        skip_serializing_if = "Option::is_none"
    )]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Accept `mode` as a string or as a bare integer whose digits are octal
fn deserialize_mode<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawMode {
        Text(String),
        Number(u64),
    }

    Ok(match Option::<RawMode>::deserialize(deserializer)? {
        Some(RawMode::Text(text)) => Some(text),
        Some(RawMode::Number(digits)) => Some(digits.to_string()),
        None => None,
    })
}

/// Lowercase hex SHA-256 of rendered content
pub fn content_digest(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

pub fn validate_template_task(task: &TemplateTask) -> Result<(), TaskError> {
    match (&task.src, &task.content) {
        (Some(_), Some(_)) => {
            return Err(TaskError::Invalid(
                "src and content are mutually exclusive".to_string(),
            ))
        }
        (None, None) => {
            return Err(TaskError::Invalid(
                "one of src or content is required".to_string(),
            ))
        }
        _ => {}
    }
    validate_absolute_path("dest", &task.dest)?;
    if let Some(mode) = &task.mode {
        if !is_templated(mode) && normalize_mode(mode).is_none() {
            return Err(TaskError::Invalid(format!("'{mode}' is not an octal mode")));
        }
    }
    for (field, name) in [("owner", &task.owner), ("group", &task.group)] {
        if let Some(name) = name {
            if !is_templated(name) && !is_valid_username(name) {
                return Err(TaskError::Invalid(format!(
                    "{field} '{name}' is not a valid name"
                )));
            }
        }
    }
    Ok(())
}

/// Compute the upload or metadata fix needed for already rendered content
pub fn plan_template_task(task: &TemplateTask, facts: &FileFacts) -> Result<Plan, TaskError> {
    let content = task
        .content
        .as_deref()
        .ok_or_else(|| TaskError::Invalid("template content was not rendered".to_string()))?;
    let mode = match &task.mode {
        Some(mode) => Some(
            normalize_mode(mode)
                .ok_or_else(|| TaskError::Invalid(format!("'{mode}' is not an octal mode")))?,
        ),
        None => None,
    };

    let mut plan = Plan::new();
    if facts.sha256.as_deref() != Some(content_digest(content).as_str()) {
        let mut upload = Upload::new(task.dest.clone(), content);
        upload.mode = mode.map(|m| format!("{m:04o}"));
        upload.owner = task.owner.clone();
        upload.group = task.group.clone();
        plan.put(upload);
        return Ok(plan);
    }

    if let Some(mode) = mode {
        if facts.mode.as_deref().and_then(normalize_mode) != Some(mode) {
            let mode = format!("{mode:04o}");
            plan.run_argv(&["chmod", mode.as_str(), "--", task.dest.as_str()])?;
        }
    }

    let owner = task
        .owner
        .as_ref()
        .filter(|o| facts.owner.as_ref() != Some(*o));
    let group = task
        .group
        .as_ref()
        .filter(|g| facts.group.as_ref() != Some(*g));
    let ownership = match (owner, group) {
        (Some(owner), Some(group)) => Some(format!("{owner}:{group}")),
        (Some(owner), None) => Some(owner.clone()),
        (None, Some(group)) => Some(format!(":{group}")),
        (None, None) => None,
    };
    if let Some(ownership) = ownership {
        plan.run_argv(&["chown", ownership.as_str(), "--", task.dest.as_str()])?;
    }
    Ok(plan)
}
