//! Authorized key facts

use super::is_missing_file;
use super::user_facts::passwd_entry;
use crate::apply::AuthorizedKeyTask;
use crate::connection::HostSession;
use crate::error::FactError;

/// Observed state of a user's authorized_keys file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFacts {
    pub user_exists: bool,
    /// Primary group, used to own `~/.ssh`
    pub group: Option<String>,
    /// Resolved path of the authorized_keys file
    pub path: String,
    pub dir_exists: bool,
    /// Current lines, or `None` when the file is absent
    pub lines: Option<Vec<String>>,
}

pub(super) async fn gather(
    session: &HostSession,
    task: &AuthorizedKeyTask,
) -> Result<KeyFacts, FactError> {
    let Some((home, _)) = passwd_entry(session, &task.user).await? else {
        return Ok(KeyFacts::default());
    };

    let path = task
        .path
        .clone()
        .unwrap_or_else(|| format!("{}/.ssh/authorized_keys", home.trim_end_matches('/')));
    let dir = match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    };

    let group = session
        .probe_ok("primary group", &["id", "-gn", task.user.as_str()])
        .await?
        .stdout
        .trim()
        .to_string();

    let dir_exists = session
        .probe("ssh directory", &["test", "-d", dir.as_str()])
        .await?
        .success();

    let lines = if dir_exists {
        let result = session
            .probe("authorized_keys", &["cat", "--", path.as_str()])
            .await?;
        if result.success() {
            Some(result.stdout.lines().map(String::from).collect())
        } else if is_missing_file(&result) {
            None
        } else {
            return Err(FactError::Unexpected {
                command: format!("cat -- {path}"),
                status: result.status,
                stderr: result.stderr.trim().to_string(),
            });
        }
    } else {
        None
    };

    Ok(KeyFacts {
        user_exists: true,
        group: Some(group),
        path,
        dir_exists,
        lines,
    })
}
