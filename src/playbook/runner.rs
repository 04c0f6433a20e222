//! Playbook runner
//!
//! One tokio task per targeted host, admitted through a semaphore sized by
//! `forks`. Inside a host every task and handler runs strictly in order. The
//! playbook, inventory, variables and renderer are shared read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde_yaml::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handlers::{HandlerId, PendingHandlers};
use super::state::{HostMachine, HostState};
use super::{LoopSource, Play, Playbook, TaskDecl};
use crate::apply::executor::TaskExecutor;
use crate::apply::templating::{is_templated, TemplateRenderer};
use crate::apply::variables::{Redactor, VariableSet};
use crate::apply::Action;
use crate::config::CredentialPolicy;
use crate::connection::{Connector, HostSession};
use crate::error::{ConfigError, TaskError};
use crate::inventory::{Host, InjectedVars, Inventory, Resolver};
use crate::report::{HostReport, RunReport, TaskOutcome, TaskRecord};

/// Knobs for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Compute plans without executing them
    pub check_mode: bool,
    /// Narrow every play to a group or a single host
    pub limit: Option<String>,
    pub forks: usize,
    /// Stop every host after the first host failure
    pub any_errors_fatal: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check_mode: false,
            limit: None,
            forks: 5,
            any_errors_fatal: false,
        }
    }
}

/// Result of the checks made before any host is contacted
#[derive(Debug, Clone)]
pub struct Preflight {
    /// Targeted hosts in first-play order
    pub hosts: Vec<String>,
    pub vars: BTreeMap<String, VariableSet>,
}

/// Validate the playbook, the injected values, credentials and variables
pub fn preflight(
    playbook: &Playbook,
    inventory: &Inventory,
    mut injected: InjectedVars,
    policy: CredentialPolicy,
    limit: Option<&str>,
) -> Result<Preflight, ConfigError> {
    playbook.validate(inventory)?;
    injected.validate(&playbook.injected)?;

    let mut seen = BTreeSet::new();
    let mut targets: Vec<&Host> = Vec::new();
    for play in &playbook.plays {
        for host in inventory.select(&play.hosts, limit)? {
            if seen.insert(host.address.as_str()) {
                targets.push(host);
            }
        }
    }
    if let (Some(limit), true) = (limit, targets.is_empty()) {
        return Err(ConfigError::Invalid(format!(
            "limit '{limit}' matches no host targeted by the playbook"
        )));
    }
    for host in &targets {
        inventory.check_credentials(host)?;
    }

    let resolver = Resolver::new(inventory, &playbook.vars, &injected, policy)
        .with_required(&playbook.required_vars, &playbook.injected);
    resolver.check_credentials()?;
    let vars = resolver.resolve_all(targets.iter().copied())?;

    Ok(Preflight {
        hosts: targets.iter().map(|h| h.address.clone()).collect(),
        vars,
    })
}

struct Shared {
    playbook: Arc<Playbook>,
    inventory: Arc<Inventory>,
    vars: BTreeMap<String, VariableSet>,
    connector: Arc<dyn Connector>,
    executor: TaskExecutor,
    options: RunOptions,
    cancel: Arc<AtomicBool>,
    halted: AtomicBool,
}

/// Drives a validated playbook against its hosts
pub struct Runner {
    shared: Arc<Shared>,
    hosts: Vec<String>,
}

impl Runner {
    pub fn new(
        playbook: Arc<Playbook>,
        inventory: Arc<Inventory>,
        preflight: Preflight,
        connector: Arc<dyn Connector>,
        options: RunOptions,
    ) -> Self {
        let renderer = Arc::new(TemplateRenderer::new());
        let executor = TaskExecutor::new(renderer, playbook.base_dir.clone(), options.check_mode);
        Self {
            shared: Arc::new(Shared {
                playbook,
                inventory,
                vars: preflight.vars,
                connector,
                executor,
                options,
                cancel: Arc::new(AtomicBool::new(false)),
                halted: AtomicBool::new(false),
            }),
            hosts: preflight.hosts,
        }
    }

    /// Setting this flag stops every worker before its next task
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.cancel)
    }

    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.shared.options.forks.max(1)));
        info!(
            playbook = %self.shared.playbook.name,
            hosts = self.hosts.len(),
            forks = self.shared.options.forks,
            check_mode = self.shared.options.check_mode,
            "starting run"
        );

        let handles: Vec<_> = self
            .hosts
            .iter()
            .map(|address| {
                let shared = Arc::clone(&self.shared);
                let semaphore = Arc::clone(&semaphore);
                let span = info_span!("host", host = %address);
                let address = address.clone();
                tokio::spawn(
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        run_host(&shared, &address).await
                    }
                    .instrument(span),
                )
            })
            .collect();

        let results = join_all(handles).await;
        let reports = self
            .hosts
            .iter()
            .zip(results)
            .map(|(address, result)| match result {
                Ok(report) => report,
                Err(err) => {
                    error!(host = %address, error = %err, "host worker aborted");
                    let mut report = HostReport::new(address.clone());
                    report.state = HostState::Failed;
                    report.tasks.push(TaskRecord {
                        play: String::new(),
                        task: "host worker".to_string(),
                        item: None,
                        handler: false,
                        outcome: TaskOutcome::Failed,
                        reason: Some(err.to_string()),
                        ignored: false,
                    });
                    report
                }
            })
            .collect();

        RunReport::new(
            self.shared.playbook.name.clone(),
            self.shared.options.check_mode,
            self.shared.cancel.load(Ordering::SeqCst),
            started_at,
            reports,
        )
    }
}

async fn run_host(shared: &Shared, address: &str) -> HostReport {
    let (Some(host), Some(vars)) = (shared.inventory.host(address), shared.vars.get(address)) else {
        let mut report = HostReport::new(address);
        report.state = HostState::Failed;
        return report;
    };
    HostWorker::new(shared, host, vars).run().await
}

/// Sequential execution of every play, task and handler for one host
struct HostWorker<'a> {
    shared: &'a Shared,
    host: &'a Host,
    vars: &'a VariableSet,
    redactor: Redactor,
    machine: HostMachine,
    report: HostReport,
    pending: PendingHandlers,
}

impl<'a> HostWorker<'a> {
    fn new(shared: &'a Shared, host: &'a Host, vars: &'a VariableSet) -> Self {
        Self {
            shared,
            host,
            vars,
            redactor: vars.redactor(),
            machine: HostMachine::new(host.address.clone()),
            report: HostReport::new(host.address.clone()),
            pending: PendingHandlers::new(),
        }
    }

    async fn run(mut self) -> HostReport {
        let playbook = Arc::clone(&self.shared.playbook);
        let plays: Vec<(usize, &Play)> = playbook
            .plays
            .iter()
            .enumerate()
            .filter(|(_, play)| self.host.in_group(&play.hosts))
            .collect();

        let session = if self.stop_reason().is_none() {
            self.connect().await
        } else {
            None
        };

        for &(play_index, play) in &plays {
            let play_session = session
                .as_ref()
                .map(|s| s.with_become(self.host.escalates(play.escalate)));
            for task in &play.tasks {
                match (&play_session, self.stop_reason()) {
                    (Some(session), None) => {
                        self.run_task(session, play_index, play, task, false).await
                    }
                    (_, reason) => self.skip(play, task, false, None, reason),
                }
            }
        }

        self.flush_handlers(session.as_ref(), &playbook).await;

        if let Some(session) = session {
            if let Err(err) = session.close().await {
                debug!(host = %self.host.address, error = %err, "close failed");
            }
        }
        self.report.state = self.machine.state();
        self.report
    }

    async fn connect(&mut self) -> Option<HostSession> {
        match self.shared.connector.connect(self.host).await {
            Ok(conn) => Some(HostSession::new(
                self.host.address.clone(),
                conn,
                false,
                self.redactor.clone(),
            )),
            Err(err) => {
                let reason = self.redactor.redact(&err.to_string());
                error!(host = %self.host.address, error = %reason, "connection failed");
                self.push(TaskRecord {
                    play: String::new(),
                    task: "connect".to_string(),
                    item: None,
                    handler: false,
                    outcome: TaskOutcome::Failed,
                    reason: Some(reason),
                    ignored: false,
                });
                self.host_failed();
                None
            }
        }
    }

    /// Run every pending handler once, in declaration order
    async fn flush_handlers(&mut self, session: Option<&HostSession>, playbook: &Playbook) {
        let ready = session.is_some() && self.stop_reason().is_none();
        if ready && self.enter(HostState::Handling).is_err() {
            return;
        }

        for id in self.pending.drain() {
            let Some(play) = playbook.plays.get(id.play) else {
                continue;
            };
            let Some(handler) = play.handlers.get(id.index) else {
                continue;
            };
            match (session, self.stop_reason()) {
                (Some(session), None) => {
                    let session = session.with_become(self.host.escalates(play.escalate));
                    self.run_task(&session, id.play, play, handler, true).await;
                }
                (_, reason) => self.skip(play, handler, true, None, reason),
            }
        }

        if ready && self.machine.state() != HostState::Failed {
            let _ = self.enter(HostState::Done);
        }
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.machine.state() == HostState::Failed {
            Some("host failed earlier in the run")
        } else if self.shared.cancel.load(Ordering::SeqCst) {
            Some("run interrupted")
        } else if self.shared.options.any_errors_fatal && self.shared.halted.load(Ordering::SeqCst) {
            Some("stopped after another host failed")
        } else {
            None
        }
    }

    fn host_failed(&mut self) {
        self.machine.fail();
        if self.shared.options.any_errors_fatal {
            self.shared.halted.store(true, Ordering::SeqCst);
        }
    }

    fn enter(&mut self, state: HostState) -> Result<(), TaskError> {
        self.machine.advance(state).map_err(|err| {
            error!(error = %err, "state machine violation");
            TaskError::Invalid(err.to_string())
        })
    }

    async fn run_task(
        &mut self,
        session: &HostSession,
        play_index: usize,
        play: &Play,
        task: &TaskDecl,
        handler: bool,
    ) {
        let items = match self.loop_items(task) {
            Ok(items) => items,
            Err(err) => {
                self.fail(play, task, handler, None, err);
                return;
            }
        };

        for item in items {
            let label = item.as_ref().map(|value| self.item_label(value));
            if let Some(reason) = self.stop_reason() {
                self.skip(play, task, handler, label, Some(reason));
                continue;
            }

            let context = match &item {
                Some(value) => self.vars.context_with(&task.loop_var, value),
                None => self.vars.to_context(),
            };

            if let Some(condition) = &task.when {
                let shared = self.shared;
                let renderer = shared.executor.renderer();
                match renderer.eval_condition(&task.display_name(), condition, &context) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip(play, task, handler, label, Some("condition is false"));
                        continue;
                    }
                    Err(err) => {
                        self.fail(play, task, handler, label, err.into());
                        continue;
                    }
                }
            }

            match self.apply(session, task, &context, handler).await {
                Ok((outcome, action)) => {
                    if outcome == TaskOutcome::Changed {
                        for name in &task.notify {
                            self.notify(play_index, play, name);
                        }
                    }
                    if let Action::Notify(notify) = &action {
                        for name in &notify.handlers {
                            self.notify(play_index, play, name);
                        }
                    }
                    self.record(play, task, handler, label, outcome, None);
                }
                Err(err) => self.fail(play, task, handler, label, err),
            }
        }
    }

    async fn apply(
        &mut self,
        session: &HostSession,
        task: &TaskDecl,
        context: &minijinja::Value,
        handler: bool,
    ) -> Result<(TaskOutcome, Action), TaskError> {
        let shared = self.shared;
        let executor = &shared.executor;
        let action = executor.render_action(&task.display_name(), &task.action, context)?;
        // handlers gather and execute while the host stays in `handling`
        if !handler {
            self.enter(HostState::Gathering)?;
        }
        let snapshot = executor.gather(session, &action).await?;
        if !handler {
            self.enter(HostState::Executing)?;
        }
        let outcome = executor.execute(session, &action, &snapshot).await?;
        Ok((outcome, action))
    }

    fn loop_items(&self, task: &TaskDecl) -> Result<Vec<Option<Value>>, TaskError> {
        let Some(source) = &task.loop_source else {
            return Ok(vec![None]);
        };
        let renderer = self.shared.executor.renderer();
        let context = self.vars.to_context();
        let list = match source {
            LoopSource::Variable(expr) if is_templated(expr) => {
                renderer.render_value("loop", &Value::String(expr.clone()), &context)?
            }
            LoopSource::Variable(name) => self.vars.get(name).cloned().ok_or_else(|| {
                TaskError::Invalid(format!("loop variable '{name}' is not defined"))
            })?,
            LoopSource::Items(items) => {
                renderer.render_value("loop", &Value::Sequence(items.clone()), &context)?
            }
        };
        match list {
            Value::Sequence(items) => Ok(items.into_iter().map(Some).collect()),
            _ => Err(TaskError::Invalid("loop does not yield a list".to_string())),
        }
    }

    /// Short label for a loop item: its `name` field when it has one
    fn item_label(&self, item: &Value) -> String {
        let label = match item {
            Value::String(s) => s.clone(),
            Value::Mapping(map) => match map.get("name") {
                Some(Value::String(name)) => name.clone(),
                _ => serde_json::to_string(item).unwrap_or_default(),
            },
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        self.redactor.redact(&label)
    }

    fn notify(&mut self, play_index: usize, play: &Play, name: &str) {
        match play.handler_index(name) {
            Some(index) => {
                let id = HandlerId {
                    play: play_index,
                    index,
                };
                if self.pending.notify(id) {
                    debug!(host = %self.host.address, handler = name, "handler notified");
                }
            }
            None => warn!(host = %self.host.address, handler = name, "notified handler does not exist"),
        }
    }

    fn fail(
        &mut self,
        play: &Play,
        task: &TaskDecl,
        handler: bool,
        item: Option<String>,
        err: TaskError,
    ) {
        let reason = self.redactor.redact(&err.to_string());
        if task.ignore_errors {
            warn!(host = %self.host.address, task = %task.display_name(), error = %reason, "task failed, ignoring");
            if self.machine.state() == HostState::Gathering {
                let _ = self.enter(HostState::Executing);
            }
        } else {
            error!(host = %self.host.address, task = %task.display_name(), error = %reason, "task failed");
            self.host_failed();
        }
        self.push(TaskRecord {
            play: play.name.clone(),
            task: task.display_name(),
            item,
            handler,
            outcome: TaskOutcome::Failed,
            reason: Some(reason),
            ignored: task.ignore_errors,
        });
    }

    fn skip(
        &mut self,
        play: &Play,
        task: &TaskDecl,
        handler: bool,
        item: Option<String>,
        reason: Option<&str>,
    ) {
        self.record(
            play,
            task,
            handler,
            item,
            TaskOutcome::Skipped,
            reason.map(String::from),
        );
    }

    fn record(
        &mut self,
        play: &Play,
        task: &TaskDecl,
        handler: bool,
        item: Option<String>,
        outcome: TaskOutcome,
        reason: Option<String>,
    ) {
        self.push(TaskRecord {
            play: play.name.clone(),
            task: task.display_name(),
            item,
            handler,
            outcome,
            reason,
            ignored: false,
        });
    }

    fn push(&mut self, record: TaskRecord) {
        let item = record
            .item
            .as_ref()
            .map(|i| format!(" ({i})"))
            .unwrap_or_default();
        let kind = if record.handler { "handler " } else { "" };
        match &record.reason {
            Some(reason) if record.outcome == TaskOutcome::Failed => println!(
                "[{}] {}: {}{}{}: {}",
                self.host.address, record.outcome, kind, record.task, item, reason
            ),
            _ => println!(
                "[{}] {}: {}{}{}",
                self.host.address, record.outcome, kind, record.task, item
            ),
        }
        info!(
            host = %self.host.address,
            task = %record.task,
            outcome = %record.outcome,
            state = %self.machine.state(),
            "task finished"
        );
        self.report.tasks.push(record);
    }
}
