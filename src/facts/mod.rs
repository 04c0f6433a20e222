//! Fact gathering
//!
//! Read-only probes that capture the slice of remote state one task needs to
//! decide whether it must act. A snapshot is taken immediately before the
//! task is planned and discarded afterwards. Probes never mutate the host.

mod command_facts;
mod file_facts;
mod key_facts;
mod package_facts;
mod service_facts;
mod user_facts;

use tracing::debug;

use crate::apply::Action;
use crate::connection::{CommandResult, HostSession};
use crate::error::FactError;

pub use command_facts::CommandFacts;
pub use file_facts::FileFacts;
pub use key_facts::KeyFacts;
pub use package_facts::PackageFacts;
pub use service_facts::ServiceFacts;
pub use user_facts::UserFacts;

/// Observed state relevant to one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactSnapshot {
    /// The action needs no facts
    None,
    User(UserFacts),
    AuthorizedKey(KeyFacts),
    Package(PackageFacts),
    File(FileFacts),
    Service(ServiceFacts),
    Command(CommandFacts),
}

/// Gather the facts `action` needs from the host behind `session`
pub async fn gather(session: &HostSession, action: &Action) -> Result<FactSnapshot, FactError> {
    let snapshot = match action {
        Action::User(task) => FactSnapshot::User(user_facts::gather(session, task).await?),
        Action::AuthorizedKey(task) => {
            FactSnapshot::AuthorizedKey(key_facts::gather(session, task).await?)
        }
        Action::Package(task) => FactSnapshot::Package(package_facts::gather(session, task).await?),
        Action::Template(task) => {
            FactSnapshot::File(file_facts::gather(session, &task.dest).await?)
        }
        Action::Service(task) => FactSnapshot::Service(service_facts::gather(session, task).await?),
        Action::Command(task) => FactSnapshot::Command(command_facts::gather(session, task).await?),
        Action::Notify(_) => FactSnapshot::None,
    };
    debug!(host = session.address(), task_type = action.task_type(), snapshot = ?snapshot, "facts gathered");
    Ok(snapshot)
}

/// A probe that failed only because the path does not exist
pub(crate) fn is_missing_file(result: &CommandResult) -> bool {
    !result.success() && result.stderr.contains("No such file or directory")
}
