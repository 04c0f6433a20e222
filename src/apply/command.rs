//! Command task
//!
//! Runs a shell line on the host. A command has no observable target state,
//! so it always reports `changed` unless a guard holds: the `creates` path
//! exists, the `removes` path is absent, or the `unless` line exits zero.
//! The `unless` line also runs in check mode and must not change the host.
//!
//! # Examples
//!
//! ## Install app dependencies once
//!
//! **YAML Format:**
//! ```yaml
//! - name: npm install
//!   type: command
//!   cmd: npm ci --omit=dev
//!   chdir: /srv/app
//!   become_user: nodeapp
//!   creates: /srv/app/node_modules
//! ```
//!
//! ## Run migrations until the schema is current
//!
//! ```yaml
//! - name: migrate
//!   type: command
//!   cmd: /srv/app/bin/migrate
//!   unless: /srv/app/bin/migrate --status | grep -q up-to-date
//! ```

use serde::{Deserialize, Serialize};

use super::{validate_absolute_path, Plan};
use crate::connection::RemoteCommand;
use crate::error::TaskError;
use crate::facts::CommandFacts;

/// Shell command task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTask {
    /// Shell line, run by `sh -c`
    pub cmd: String,
    /// Skip when this path exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creates: Option<String>,
    /// Skip when this path does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removes: Option<String>,
    /// Skip when this shell line exits zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<String>,
    /// Run as this user through sudo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,
}

pub fn validate_command_task(task: &CommandTask) -> Result<(), TaskError> {
    if task.cmd.trim().is_empty() {
        return Err(TaskError::Invalid("cmd cannot be empty".to_string()));
    }
    if let Some(creates) = &task.creates {
        validate_absolute_path("creates", creates)?;
    }
    if let Some(removes) = &task.removes {
        validate_absolute_path("removes", removes)?;
    }
    if task.unless.as_ref().is_some_and(|line| line.trim().is_empty()) {
        return Err(TaskError::Invalid("unless cannot be empty".to_string()));
    }
    if let Some(chdir) = &task.chdir {
        validate_absolute_path("chdir", chdir)?;
    }
    Ok(())
}

pub fn plan_command_task(task: &CommandTask, facts: &CommandFacts) -> Result<Plan, TaskError> {
    let mut plan = Plan::new();
    if facts.creates_exists == Some(true)
        || facts.removes_exists == Some(false)
        || facts.unless_succeeded == Some(true)
    {
        return Ok(plan);
    }

    let line = match &task.chdir {
        Some(dir) => format!("cd -- {} && {}", shlex::try_quote(dir)?, task.cmd),
        None => task.cmd.clone(),
    };
    plan.run(RemoteCommand::shell(line).with_become_user(task.become_user.clone()));
    Ok(plan)
}
