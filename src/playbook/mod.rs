//! Playbook model, loading and pre-flight validation
//!
//! A playbook is an ordered list of plays. Each play targets one inventory
//! group and carries its own tasks and handlers. Files are YAML, JSON or TOML
//! depending on their extension.
//!
//! ```yaml
//! name: provision
//! vars:
//!   app_port: 3000
//! required_vars: [app_port]
//! injected:
//!   accounts: { shape: accounts }
//!   app_secret: { shape: string, secret: true }
//! plays:
//!   - name: Accounts
//!     hosts: accounts
//!     become: true
//!     tasks:
//!       - name: Create developer accounts
//!         type: user
//!         user: "{{ item.name }}"
//!         loop: accounts
//! ```

pub mod handlers;
pub mod runner;
pub mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::apply::templating::is_templated;
use crate::apply::Action;
use crate::error::ConfigError;
use crate::inventory::{InjectedDecl, Inventory};

pub use handlers::{HandlerId, PendingHandlers};
pub use runner::{preflight, Preflight, RunOptions, Runner};
pub use state::{HostMachine, HostState};

fn default_loop_var() -> String {
    "item".to_string()
}

/// What a task iterates over
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LoopSource {
    /// Variable name, or a single `{{ expr }}` yielding a list
    Variable(String),
    /// Inline items, each rendered before use
    Items(Vec<Value>),
}

/// A task as declared: common controls around one action
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Mapping")]
pub struct TaskDecl {
    pub name: Option<String>,
    pub notify: Vec<String>,
    pub ignore_errors: bool,
    pub when: Option<String>,
    pub loop_source: Option<LoopSource>,
    pub loop_var: String,
    pub action: Action,
}

impl TaskDecl {
    /// Name shown in progress lines and reports
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.action.task_type().to_string())
    }

    /// Handlers this task marks pending: `notify:` plus a notify action's list
    pub fn notified(&self) -> impl Iterator<Item = &String> {
        let action_handlers = match &self.action {
            Action::Notify(task) => task.handlers.as_slice(),
            _ => &[],
        };
        self.notify.iter().chain(action_handlers)
    }
}

fn take<T: serde::de::DeserializeOwned>(map: &mut Mapping, key: &str) -> Result<Option<T>, String> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_yaml::from_value(value)
            .map(Some)
            .map_err(|e| format!("invalid '{key}': {e}")),
    }
}

impl TryFrom<Mapping> for TaskDecl {
    type Error = String;

    fn try_from(mut map: Mapping) -> Result<Self, Self::Error> {
        let name: Option<String> = take(&mut map, "name")?;
        let notify = match map.remove("notify") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(one)) => vec![one],
            Some(other) => serde_yaml::from_value(other)
                .map_err(|e| format!("invalid 'notify': {e}"))?,
        };
        let ignore_errors = take(&mut map, "ignore_errors")?.unwrap_or(false);
        let when = match map.remove("when") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(flag.to_string()),
            Some(Value::String(expr)) => Some(expr),
            Some(_) => return Err("'when' must be an expression string".to_string()),
        };
        let loop_source = take(&mut map, "loop")?;
        let loop_var = take(&mut map, "loop_var")?.unwrap_or_else(default_loop_var);

        let label = name.clone().unwrap_or_else(|| "unnamed task".to_string());
        let action = serde_yaml::from_value(Value::Mapping(map))
            .map_err(|e| format!("task '{label}': {e}"))?;

        Ok(Self {
            name,
            notify,
            ignore_errors,
            when,
            loop_source,
            loop_var,
            action,
        })
    }
}

/// One play: a group of hosts and the tasks to run on them
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Play {
    pub name: String,
    /// Target group
    pub hosts: String,
    #[serde(default, rename = "become")]
    pub escalate: bool,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
    #[serde(default)]
    pub handlers: Vec<TaskDecl>,
}

impl Play {
    /// Position of a handler by name
    pub fn handler_index(&self, name: &str) -> Option<usize> {
        self.handlers
            .iter()
            .position(|h| h.name.as_deref() == Some(name))
    }
}

/// A whole playbook file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    pub name: String,
    /// Defaults layer of every host's variables
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_vars: Vec<String>,
    /// Shapes of externally injected variables
    #[serde(default)]
    pub injected: BTreeMap<String, InjectedDecl>,
    pub plays: Vec<Play>,
    /// Directory relative template paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Playbook {
    /// Load a playbook, choosing the parser by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        let mut playbook: Playbook = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
            Some("toml") => toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
            }
            _ => {
                return Err(parse_error(
                    "unsupported playbook format, expected .yml, .yaml, .json or .toml".to_string(),
                ))
            }
        };
        playbook.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        debug!(path = %path.display(), plays = playbook.plays.len(), "playbook loaded");
        Ok(playbook)
    }

    /// Parse YAML text, resolving templates against `base_dir`
    pub fn from_yaml(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut playbook: Playbook =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: base_dir.to_path_buf(),
                message: e.to_string(),
            })?;
        playbook.base_dir = base_dir.to_path_buf();
        Ok(playbook)
    }

    /// Every check that can be made without contacting a host
    pub fn validate(&self, inventory: &Inventory) -> Result<(), ConfigError> {
        if self.plays.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "playbook '{}' has no plays",
                self.name
            )));
        }

        for play in &self.plays {
            if inventory.group(&play.hosts).is_none() {
                return Err(ConfigError::UnknownGroup(play.hosts.clone()));
            }

            let mut handler_names = BTreeSet::new();
            for (index, handler) in play.handlers.iter().enumerate() {
                let invalid = |message: String| ConfigError::InvalidTask {
                    play: play.name.clone(),
                    index,
                    task: handler.display_name(),
                    message,
                };
                let Some(name) = &handler.name else {
                    return Err(invalid("handlers must be named".to_string()));
                };
                if !handler_names.insert(name.as_str()) {
                    return Err(invalid(format!("duplicate handler name '{name}'")));
                }
                if handler.notified().next().is_some() {
                    return Err(invalid("handlers cannot notify other handlers".to_string()));
                }
                self.validate_task(play, index, handler)?;
            }

            for (index, task) in play.tasks.iter().enumerate() {
                self.validate_task(play, index, task)?;
                for handler in task.notified() {
                    if play.handler_index(handler).is_none() {
                        return Err(ConfigError::InvalidTask {
                            play: play.name.clone(),
                            index,
                            task: task.display_name(),
                            message: format!("notifies unknown handler '{handler}'"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_task(&self, play: &Play, index: usize, task: &TaskDecl) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidTask {
            play: play.name.clone(),
            index,
            task: task.display_name(),
            message,
        };

        task.action.validate().map_err(|e| invalid(e.to_string()))?;

        if task.loop_var.trim().is_empty() {
            return Err(invalid("loop_var cannot be empty".to_string()));
        }
        if let Action::Template(template) = &task.action {
            if let Some(src) = &template.src {
                if !is_templated(src) && !self.base_dir.join(src).is_file() {
                    return Err(invalid(format!(
                        "template src '{}' not found",
                        self.base_dir.join(src).display()
                    )));
                }
            }
        }
        Ok(())
    }
}
