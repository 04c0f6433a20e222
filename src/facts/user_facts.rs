//! User account facts
//!
//! `getent passwd` for existence, home and shell, `id -nG` for group
//! membership, `getent group` for each declared group and `getent shadow`
//! when a password hash is declared.

use std::fmt;

use crate::apply::variables::MASK;
use crate::apply::UserTask;
use crate::connection::HostSession;
use crate::error::FactError;

/// `getent` exit status for "key not found"
const GETENT_NOT_FOUND: i32 = 2;

/// Observed state of one account
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UserFacts {
    pub exists: bool,
    pub home: Option<String>,
    pub shell: Option<String>,
    /// Every group the user belongs to, primary included
    pub groups: Vec<String>,
    /// Declared groups that do not exist on the host
    pub missing_groups: Vec<String>,
    pub password_hash: Option<String>,
}

// the shadow hash is never written to logs
impl fmt::Debug for UserFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFacts")
            .field("exists", &self.exists)
            .field("home", &self.home)
            .field("shell", &self.shell)
            .field("groups", &self.groups)
            .field("missing_groups", &self.missing_groups)
            .field("password_hash", &self.password_hash.as_ref().map(|_| MASK))
            .finish()
    }
}

/// Home and shell from a passwd line
pub(crate) fn parse_passwd_line(line: &str) -> Result<(String, String), FactError> {
    let fields: Vec<&str> = line.trim_end().split(':').collect();
    if fields.len() < 7 {
        return Err(FactError::Parse {
            fact: "passwd".to_string(),
            message: format!("expected 7 fields, got {}", fields.len()),
        });
    }
    Ok((fields[5].to_string(), fields[6].to_string()))
}

/// Look up a passwd entry; `None` when the account does not exist
pub(crate) async fn passwd_entry(
    session: &HostSession,
    user: &str,
) -> Result<Option<(String, String)>, FactError> {
    let result = session.probe("passwd", &["getent", "passwd", user]).await?;
    match result.status {
        0 => parse_passwd_line(&result.stdout).map(Some),
        GETENT_NOT_FOUND => Ok(None),
        status => Err(FactError::Unexpected {
            command: format!("getent passwd {user}"),
            status,
            stderr: result.stderr.trim().to_string(),
        }),
    }
}

pub(super) async fn gather(session: &HostSession, task: &UserTask) -> Result<UserFacts, FactError> {
    let mut facts = UserFacts::default();

    for group in &task.groups {
        let result = session
            .probe("group", &["getent", "group", group.as_str()])
            .await?;
        match result.status {
            0 => {}
            GETENT_NOT_FOUND => facts.missing_groups.push(group.clone()),
            status => {
                return Err(FactError::Unexpected {
                    command: format!("getent group {group}"),
                    status,
                    stderr: result.stderr.trim().to_string(),
                })
            }
        }
    }

    let Some((home, shell)) = passwd_entry(session, &task.user).await? else {
        return Ok(facts);
    };
    facts.exists = true;
    facts.home = Some(home);
    facts.shell = Some(shell);

    let groups = session
        .probe_ok("groups", &["id", "-nG", task.user.as_str()])
        .await?;
    facts.groups = groups.stdout.split_whitespace().map(String::from).collect();

    if task.password.is_some() {
        let shadow = session
            .probe_ok("shadow", &["getent", "shadow", task.user.as_str()])
            .await?;
        facts.password_hash = shadow
            .stdout
            .trim_end()
            .split(':')
            .nth(1)
            .map(String::from);
    }

    Ok(facts)
}
