//! User task
//!
//! Ensures an OS account exists with the declared shell, home, supplementary
//! groups and password hash. Existing accounts are only ever amended: groups
//! are appended, never removed.
//!
//! # Examples
//!
//! ## Create developer accounts from an injected list
//!
//! **YAML Format:**
//! ```yaml
//! - name: Create developer accounts
//!   type: user
//!   user: "{{ item.name }}"
//!   shell: "{{ item.shell | default('/bin/bash') }}"
//!   groups: "{{ item.groups | default([]) }}"
//!   password: "{{ item.password | default(none) }}"
//!   loop: accounts
//! ```
//!
//! ## Create a system user without a home directory
//!
//! **YAML Format:**
//! ```yaml
//! - name: Service account for the app
//!   type: user
//!   user: nodeapp
//!   system: true
//!   create_home: false
//!   shell: /usr/sbin/nologin
//! ```

use serde::{Deserialize, Serialize};

use super::templating::is_templated;
use super::{default_true, validate_absolute_path, Plan};
use crate::connection::RemoteCommand;
use crate::error::TaskError;
use crate::facts::UserFacts;
use crate::inventory::injected::{is_crypt_hash, is_valid_username};

/// User account task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserTask {
    /// Account name
    pub user: String,
    /// Login shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Home directory; moved with its contents when it differs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Supplementary groups, which must already exist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Whether to create home directory
    #[serde(default = "default_true")]
    pub create_home: bool,
    /// Create a system account
    #[serde(default)]
    pub system: bool,
    /// crypt(3) password hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Validate user task parameters
pub fn validate_user_task(task: &UserTask) -> Result<(), TaskError> {
    if !is_templated(&task.user) && !is_valid_username(&task.user) {
        return Err(TaskError::Invalid(format!(
            "'{}' is not a valid user name",
            task.user
        )));
    }
    if let Some(home) = &task.home {
        validate_absolute_path("home", home)?;
    }
    if let Some(shell) = &task.shell {
        validate_absolute_path("shell", shell)?;
    }
    for group in &task.groups {
        if !is_templated(group) && !is_valid_username(group) {
            return Err(TaskError::Invalid(format!(
                "'{group}' is not a valid group name"
            )));
        }
    }
    if let Some(password) = &task.password {
        if !is_templated(password) && !is_crypt_hash(password) {
            return Err(TaskError::Invalid(
                "password must be a crypt hash such as $6$...".to_string(),
            ));
        }
    }
    Ok(())
}

fn set_password(user: &str, hash: &str) -> Result<RemoteCommand, TaskError> {
    Ok(RemoteCommand::argv(&["chpasswd", "-e"])?.with_stdin(format!("{user}:{hash}\n")))
}

/// Compute the steps that bring the account in line with the declaration
pub fn plan_user_task(task: &UserTask, facts: &UserFacts) -> Result<Plan, TaskError> {
    if !facts.missing_groups.is_empty() {
        return Err(TaskError::Invalid(format!(
            "groups do not exist on host: {}",
            facts.missing_groups.join(", ")
        )));
    }

    let mut plan = Plan::new();

    if !facts.exists {
        let groups = task.groups.join(",");
        let mut words = vec!["useradd"];
        if task.system {
            words.push("-r");
        }
        words.push(if task.create_home { "-m" } else { "-M" });
        if let Some(home) = &task.home {
            words.extend(["-d", home.as_str()]);
        }
        if let Some(shell) = &task.shell {
            words.extend(["-s", shell.as_str()]);
        }
        if !groups.is_empty() {
            words.extend(["-G", groups.as_str()]);
        }
        words.push(task.user.as_str());
        plan.run_argv(&words)?;

        if let Some(hash) = &task.password {
            plan.run(set_password(&task.user, hash)?);
        }
        return Ok(plan);
    }

    if let Some(shell) = &task.shell {
        if facts.shell.as_deref() != Some(shell.as_str()) {
            plan.run_argv(&["usermod", "-s", shell.as_str(), task.user.as_str()])?;
        }
    }

    let missing: Vec<&str> = task
        .groups
        .iter()
        .filter(|g| !facts.groups.contains(g))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        let joined = missing.join(",");
        plan.run_argv(&["usermod", "-a", "-G", joined.as_str(), task.user.as_str()])?;
    }

    if let Some(home) = &task.home {
        if facts.home.as_deref() != Some(home.as_str()) {
            plan.run_argv(&["usermod", "-d", home.as_str(), "-m", task.user.as_str()])?;
        }
    }

    if let Some(hash) = &task.password {
        if facts.password_hash.as_deref() != Some(hash.as_str()) {
            plan.run(set_password(&task.user, hash)?);
        }
    }

    Ok(plan)
}
