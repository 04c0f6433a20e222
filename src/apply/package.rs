//! Package task
//!
//! Ensures an OS package is installed. Without a `version` any installed
//! version satisfies the task; with one, the installed version must equal it
//! exactly (`1.18.0-6ubuntu14.4`, not `1.18.0`) or the pinned one is installed.
//!
//! # Examples
//!
//! ## Install the application runtime
//!
//! **YAML Format:**
//! ```yaml
//! - name: Node.js runtime
//!   type: package
//!   package: nodejs
//!   update_cache: true
//! ```
//!
//! **TOML Format:**
//! ```toml
//! [[plays.tasks]]
//! name = "Pinned nginx"
//! type = "package"
//! package = "nginx"
//! version = "1.18.0-6ubuntu14.4"
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::templating::is_templated;
use super::Plan;
use crate::connection::RemoteCommand;
use crate::error::TaskError;
use crate::facts::PackageFacts;

static PACKAGE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9.+_-]*$").expect("valid regex"));

/// Package manager driving the install
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Apt,
    Dnf,
    Yum,
}

/// Package task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageTask {
    /// Package name
    pub package: String,
    /// Exact version to pin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub manager: PackageManager,
    /// Refresh the apt index before installing
    #[serde(default)]
    pub update_cache: bool,
}

/// Validate package task parameters
pub fn validate_package_task(task: &PackageTask) -> Result<(), TaskError> {
    if !is_templated(&task.package) && !PACKAGE_NAME_RE.is_match(&task.package) {
        return Err(TaskError::Invalid(format!(
            "'{}' is not a valid package name",
            task.package
        )));
    }
    if let Some(version) = &task.version {
        if version.trim().is_empty() || version.chars().any(char::is_whitespace) {
            return Err(TaskError::Invalid(format!(
                "'{version}' is not a valid package version"
            )));
        }
    }
    if task.update_cache && task.manager != PackageManager::Apt {
        return Err(TaskError::Invalid(
            "update_cache is only supported with the apt manager".to_string(),
        ));
    }
    Ok(())
}

/// Compute the install steps, if any
pub fn plan_package_task(task: &PackageTask, facts: &PackageFacts) -> Result<Plan, TaskError> {
    let mut plan = Plan::new();
    let satisfied = match (&facts.installed_version, &task.version) {
        (None, _) => false,
        (Some(_), None) => true,
        // pins compare exactly, as they are passed to the manager verbatim
        (Some(installed), Some(wanted)) => installed == wanted,
    };
    if satisfied {
        return Ok(plan);
    }

    match task.manager {
        PackageManager::Apt => {
            let target = match &task.version {
                Some(version) => format!("{}={}", task.package, version),
                None => task.package.clone(),
            };
            if task.update_cache {
                plan.run_argv(&["apt-get", "update", "-q"])?;
            }
            plan.run(
                RemoteCommand::argv(&["apt-get", "install", "-y", "-q", target.as_str()])?
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
            );
        }
        PackageManager::Dnf | PackageManager::Yum => {
            let binary = if task.manager == PackageManager::Dnf {
                "dnf"
            } else {
                "yum"
            };
            let target = match &task.version {
                Some(version) => format!("{}-{}", task.package, version),
                None => task.package.clone(),
            };
            plan.run_argv(&[binary, "install", "-y", target.as_str()])?;
        }
    }
    Ok(plan)
}
