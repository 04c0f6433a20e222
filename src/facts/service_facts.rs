//! systemd unit facts

use crate::apply::ServiceTask;
use crate::connection::HostSession;
use crate::error::FactError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFacts {
    pub active: bool,
    /// Only probed when the task declares `enabled`
    pub enabled: Option<bool>,
}

/// Unit file states that start the unit at boot or on demand
fn is_enabled_state(state: &str) -> bool {
    matches!(
        state,
        "enabled" | "enabled-runtime" | "static" | "alias" | "indirect" | "generated"
    )
}

pub(super) async fn gather(
    session: &HostSession,
    task: &ServiceTask,
) -> Result<ServiceFacts, FactError> {
    let unit = task.service.as_str();

    // is-active exits non-zero for every state but "active"
    let active = session
        .probe("service state", &["systemctl", "is-active", unit])
        .await?
        .stdout
        .trim()
        == "active";

    let enabled = if task.enabled.is_some() {
        let result = session
            .probe("service enablement", &["systemctl", "is-enabled", unit])
            .await?;
        Some(is_enabled_state(result.stdout.trim()))
    } else {
        None
    };

    Ok(ServiceFacts { active, enabled })
}
