//! Command guard facts

use crate::apply::CommandTask;
use crate::connection::HostSession;
use crate::error::FactError;

/// Guard outcomes; each is `None` when its guard is not declared
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFacts {
    pub creates_exists: Option<bool>,
    pub removes_exists: Option<bool>,
    /// Whether the `unless` line exited zero
    pub unless_succeeded: Option<bool>,
}

async fn path_exists(session: &HostSession, fact: &str, path: &str) -> Result<bool, FactError> {
    let result = session.probe(fact, &["test", "-e", path]).await?;
    Ok(result.success())
}

pub(super) async fn gather(
    session: &HostSession,
    task: &CommandTask,
) -> Result<CommandFacts, FactError> {
    let mut facts = CommandFacts::default();
    if let Some(creates) = &task.creates {
        facts.creates_exists = Some(path_exists(session, "creates", creates).await?);
    }
    if let Some(removes) = &task.removes {
        facts.removes_exists = Some(path_exists(session, "removes", removes).await?);
    }
    if let Some(unless) = &task.unless {
        let result = session.probe("unless", &["sh", "-c", unless.as_str()]).await?;
        facts.unless_succeeded = Some(result.success());
    }
    Ok(facts)
}
