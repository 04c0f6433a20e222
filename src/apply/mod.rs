//! Task declarations and reconciliation
//!
//! Every task type lives in its own module with the declaration struct, its
//! validation and a pure `plan_*` function that turns a fact snapshot into the
//! minimal list of remote steps. The [`executor`] drives gather, plan and
//! apply for one task on one host.
//!
//! Task types are a tagged enum keyed by `type:`:
//!
//! ```yaml
//! - name: Create developer accounts
//!   type: user
//!   user: "{{ item.name }}"
//!   shell: /bin/bash
//!   loop: accounts
//! ```

pub mod authorized_key;
pub mod command;
pub mod executor;
pub mod package;
pub mod service;
pub mod template;
pub mod templating;
pub mod user;
pub mod variables;


use serde::{Deserialize, Serialize};

use crate::connection::{RemoteCommand, Upload};
use crate::error::TaskError;

pub use authorized_key::AuthorizedKeyTask;
pub use command::CommandTask;
pub use package::{PackageManager, PackageTask};
pub use service::{ServiceState, ServiceTask};
pub use template::TemplateTask;
pub use user::UserTask;

// Default value functions
/// Default true value
pub fn default_true() -> bool {
    true
}

/// Register handlers without acting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyTask {
    /// Handler names to mark pending
    pub handlers: Vec<String>,
}

/// Types of task actions
///
/// Each action asserts an intended state; applying it to a host that already
/// matches makes no change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// OS user account
    User(UserTask),
    /// Line in a user's authorized_keys file
    AuthorizedKey(AuthorizedKeyTask),
    /// Installed OS package
    Package(PackageTask),
    /// File rendered from a template
    Template(TemplateTask),
    /// systemd unit state
    Service(ServiceTask),
    /// Shell command
    Command(CommandTask),
    /// Handler notification only
    Notify(NotifyTask),
}

impl Action {
    /// Get the task type name for this action
    pub fn task_type(&self) -> &'static str {
        match self {
            Action::User(_) => "user",
            Action::AuthorizedKey(_) => "authorized_key",
            Action::Package(_) => "package",
            Action::Template(_) => "template",
            Action::Service(_) => "service",
            Action::Command(_) => "command",
            Action::Notify(_) => "notify",
        }
    }

    /// Check declared values; templated fields are checked after rendering
    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            Action::User(task) => user::validate_user_task(task),
            Action::AuthorizedKey(task) => authorized_key::validate_authorized_key_task(task),
            Action::Package(task) => package::validate_package_task(task),
            Action::Template(task) => template::validate_template_task(task),
            Action::Service(task) => service::validate_service_task(task),
            Action::Command(task) => command::validate_command_task(task),
            Action::Notify(task) => {
                if task.handlers.is_empty() {
                    Err(TaskError::Invalid("notify lists no handlers".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// One remote step of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(RemoteCommand),
    Put(Upload),
}

impl Step {
    /// Short description for check-mode output
    pub fn describe(&self) -> String {
        match self {
            Step::Run(command) => command.line.clone(),
            Step::Put(upload) => format!("write {}", upload.path),
        }
    }
}

/// Ordered remote steps reconciling observed with declared state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty plan means the host already matches
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(&mut self, command: RemoteCommand) {
        self.steps.push(Step::Run(command));
    }

    /// Quote `words` into a command and append it
    pub fn run_argv(&mut self, words: &[&str]) -> Result<(), TaskError> {
        self.run(RemoteCommand::argv(words)?);
        Ok(())
    }

    pub fn put(&mut self, upload: Upload) {
        self.steps.push(Step::Put(upload));
    }
}

/// Reject relative or traversing paths
pub(crate) fn validate_absolute_path(field: &str, path: &str) -> Result<(), TaskError> {
    if templating::is_templated(path) {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(TaskError::Invalid(format!(
            "{field} must be an absolute path, got '{path}'"
        )));
    }
    if path.split('/').any(|part| part == "..") {
        return Err(TaskError::Invalid(format!(
            "{field} cannot contain '..': '{path}'"
        )));
    }
    Ok(())
}

/// Normalise an octal mode so `644`, `0644` and `00644` compare equal
pub(crate) fn normalize_mode(mode: &str) -> Option<u32> {
    u32::from_str_radix(mode.trim(), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
}
