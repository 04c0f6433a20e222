//! Apply task executor
//!
//! Renders a declaration against the host's variables, gathers the facts it
//! needs, computes the plan and runs it. In check mode the plan is computed
//! and logged but never executed.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::templating::TemplateRenderer;
use super::{authorized_key, command, package, service, template, user, Action, Plan, Step};
use crate::connection::HostSession;
use crate::error::TaskError;
use crate::facts::{self, FactSnapshot};
use crate::report::TaskOutcome;

/// Executor for one host's tasks
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    renderer: Arc<TemplateRenderer>,
    base_dir: PathBuf,
    check_mode: bool,
}

impl TaskExecutor {
    /// `base_dir` anchors relative template `src` paths
    pub fn new(renderer: Arc<TemplateRenderer>, base_dir: impl Into<PathBuf>, check_mode: bool) -> Self {
        Self {
            renderer,
            base_dir: base_dir.into(),
            check_mode,
        }
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Render every parameter of `action` and validate the result
    ///
    /// Template tasks come back with `content` holding the rendered text and
    /// no `src`.
    pub fn render_action(
        &self,
        name: &str,
        action: &Action,
        context: &minijinja::Value,
    ) -> Result<Action, TaskError> {
        let declared = serde_yaml::to_value(action)
            .map_err(|e| TaskError::Invalid(format!("cannot serialize task: {e}")))?;
        let rendered = self.renderer.render_value(name, &declared, context)?;
        let mut action: Action = serde_yaml::from_value(rendered)
            .map_err(|e| TaskError::Invalid(format!("rendered parameters are invalid: {e}")))?;

        if let Action::Template(task) = &mut action {
            if let Some(src) = task.src.take() {
                let path = self.base_dir.join(&src);
                let content = self.renderer.render_file(&path, context)?;
                debug!(src = %path.display(), bytes = content.len(), "rendered template");
                task.content = Some(content);
            }
        }

        action.validate()?;
        Ok(action)
    }

    /// Capture the facts a rendered action needs
    pub async fn gather(
        &self,
        session: &HostSession,
        action: &Action,
    ) -> Result<FactSnapshot, TaskError> {
        Ok(facts::gather(session, action).await?)
    }

    /// Plan against `snapshot` and run the plan unless in check mode
    pub async fn execute(
        &self,
        session: &HostSession,
        action: &Action,
        snapshot: &FactSnapshot,
    ) -> Result<TaskOutcome, TaskError> {
        let plan = plan_for(action, snapshot)?;
        if plan.is_empty() {
            return Ok(TaskOutcome::Unchanged);
        }

        let redactor = session.redactor();
        if self.check_mode {
            for step in &plan.steps {
                info!(host = session.address(), step = %redactor.redact(&step.describe()), "would run");
            }
            return Ok(TaskOutcome::Changed);
        }

        for step in plan.steps {
            match step {
                Step::Run(command) => {
                    session.execute(command).await?;
                }
                Step::Put(upload) => session.upload(upload).await?,
            }
        }
        Ok(TaskOutcome::Changed)
    }

    /// Gather then execute
    pub async fn apply(&self, session: &HostSession, action: &Action) -> Result<TaskOutcome, TaskError> {
        let snapshot = self.gather(session, action).await?;
        self.execute(session, action, &snapshot).await
    }
}

/// Dispatch to the per-type planner
pub fn plan_for(action: &Action, snapshot: &FactSnapshot) -> Result<Plan, TaskError> {
    match (action, snapshot) {
        (Action::User(task), FactSnapshot::User(facts)) => user::plan_user_task(task, facts),
        (Action::AuthorizedKey(task), FactSnapshot::AuthorizedKey(facts)) => {
            authorized_key::plan_authorized_key_task(task, facts)
        }
        (Action::Package(task), FactSnapshot::Package(facts)) => {
            package::plan_package_task(task, facts)
        }
        (Action::Template(task), FactSnapshot::File(facts)) => {
            template::plan_template_task(task, facts)
        }
        (Action::Service(task), FactSnapshot::Service(facts)) => {
            service::plan_service_task(task, facts)
        }
        (Action::Command(task), FactSnapshot::Command(facts)) => {
            command::plan_command_task(task, facts)
        }
        (Action::Notify(_), _) => Ok(Plan::new()),
        (action, snapshot) => Err(TaskError::Invalid(format!(
            "{} task got mismatched facts {snapshot:?}",
            action.task_type()
        ))),
    }
}
