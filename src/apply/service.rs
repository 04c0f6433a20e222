//! Service task
//!
//! Drives a systemd unit through `systemctl`. `started` and `stopped` act
//! only on drift; `restarted` and `reloaded` always act, which is what makes
//! them useful as handlers.
//!
//! # Examples
//!
//! ## Restart the app after a deploy
//!
//! **YAML Format:**
//! ```yaml
//! handlers:
//!   - name: restart app
//!     type: service
//!     service: nodeapp
//!     state: restarted
//! ```
//!
//! ## Keep the proxy running across reboots
//!
//! **YAML Format:**
//! ```yaml
//! - type: service
//!   service: nginx
//!   state: started
//!   enabled: true
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::templating::is_templated;
use super::Plan;
use crate::error::TaskError;
use crate::facts::ServiceFacts;

static UNIT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9@._:-]+$").expect("valid regex"));

/// Service state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Ensure service is running
    #[default]
    Started,
    /// Ensure service is stopped
    Stopped,
    /// Restart service
    Restarted,
    /// Reload service configuration
    Reloaded,
}

/// Service management task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceTask {
    /// Unit name
    pub service: String,
    #[serde(default)]
    pub state: ServiceState,
    /// Whether to enable service at boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

pub fn validate_service_task(task: &ServiceTask) -> Result<(), TaskError> {
    if !is_templated(&task.service) && !UNIT_NAME_RE.is_match(&task.service) {
        return Err(TaskError::Invalid(format!(
            "'{}' is not a valid unit name",
            task.service
        )));
    }
    Ok(())
}

/// Compute the `systemctl` calls needed
pub fn plan_service_task(task: &ServiceTask, facts: &ServiceFacts) -> Result<Plan, TaskError> {
    let unit = task.service.as_str();
    let mut plan = Plan::new();

    match (task.enabled, facts.enabled) {
        (Some(true), Some(false)) => plan.run_argv(&["systemctl", "enable", unit])?,
        (Some(false), Some(true)) => plan.run_argv(&["systemctl", "disable", unit])?,
        _ => {}
    }

    let verb = match task.state {
        ServiceState::Started if !facts.active => Some("start"),
        ServiceState::Stopped if facts.active => Some("stop"),
        ServiceState::Restarted => Some("restart"),
        ServiceState::Reloaded => Some("reload"),
        _ => None,
    };
    if let Some(verb) = verb {
        plan.run_argv(&["systemctl", verb, unit])?;
    }
    Ok(plan)
}
