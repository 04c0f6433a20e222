//! Per-host variable resolution
//!
//! Layers, lowest precedence first: playbook defaults, group variables (`all`
//! first, then parents before children, alphabetical within one depth), host
//! variables, injected variables. The magic
//! variables `inventory_hostname` and `group_names` are set last.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use tracing::{debug, warn};

use super::{Host, InjectedDecl, InjectedVars, Inventory};
use crate::apply::templating::is_templated;
use crate::apply::variables::VariableSet;
use crate::config::CredentialPolicy;
use crate::error::ConfigError;

static CREDENTIAL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|api_key|private_key)").expect("valid regex")
});

/// Whether a variable name suggests it holds a credential
pub fn looks_like_credential(name: &str) -> bool {
    CREDENTIAL_NAME_RE.is_match(name)
}

/// Builds one [`VariableSet`] per host
#[derive(Debug)]
pub struct Resolver<'a> {
    inventory: &'a Inventory,
    defaults: &'a BTreeMap<String, Value>,
    required: Vec<String>,
    injected: &'a InjectedVars,
    policy: CredentialPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(
        inventory: &'a Inventory,
        defaults: &'a BTreeMap<String, Value>,
        injected: &'a InjectedVars,
        policy: CredentialPolicy,
    ) -> Self {
        Self {
            inventory,
            defaults,
            required: Vec::new(),
            injected,
            policy,
        }
    }

    /// Names that must resolve for every targeted host
    #[must_use]
    pub fn with_required(
        mut self,
        required_vars: &[String],
        declarations: &BTreeMap<String, InjectedDecl>,
    ) -> Self {
        self.required = required_vars.to_vec();
        self.required.extend(
            declarations
                .iter()
                .filter(|(_, decl)| decl.required)
                .map(|(name, _)| name.clone()),
        );
        self.required.sort();
        self.required.dedup();
        self
    }

    /// Reject literal credentials in every file-backed layer
    pub fn check_credentials(&self) -> Result<(), ConfigError> {
        let mut layers: Vec<(String, &BTreeMap<String, Value>)> =
            vec![("playbook vars".to_string(), self.defaults)];
        layers.extend(
            self.inventory
                .groups()
                .map(|g| (format!("group '{}'", g.name), &g.vars)),
        );
        layers.extend(
            self.inventory
                .hosts()
                .map(|h| (format!("host '{}'", h.address), &h.vars)),
        );

        for (layer, vars) in layers {
            for (name, value) in vars {
                if let Some(path) = literal_credential(name, value) {
                    match self.policy {
                        CredentialPolicy::Reject => {
                            return Err(ConfigError::PlaintextCredential { name: path, layer })
                        }
                        CredentialPolicy::Warn => {
                            warn!(variable = %path, layer = %layer, "plaintext credential in variables")
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge every layer for one host
    pub fn resolve(&self, host: &Host) -> Result<VariableSet, ConfigError> {
        let mut vars = VariableSet::new();
        vars.merge(self.defaults);
        for group in self.inventory.group_layers(host) {
            vars.merge(&group.vars);
        }
        vars.merge(&host.vars);
        vars.merge(self.injected.values());

        vars.set("inventory_hostname", Value::String(host.address.clone()));
        vars.set(
            "group_names",
            Value::Sequence(host.groups.iter().cloned().map(Value::String).collect()),
        );

        for name in self.injected.secret_names() {
            vars.mark_secret(name.clone());
        }
        // undeclared injected values are secret when their name says so
        for name in self.injected.values().keys() {
            if looks_like_credential(name) {
                vars.mark_secret(name.clone());
            }
        }
        for value in self.injected.secret_values() {
            vars.add_secret_value(value.clone());
        }

        for name in &self.required {
            if matches!(vars.get(name), None | Some(Value::Null)) {
                return Err(ConfigError::MissingVariable {
                    host: host.address.clone(),
                    name: name.clone(),
                });
            }
        }

        debug!(host = %host.address, count = vars.len(), "resolved variables");
        Ok(vars)
    }

    /// Resolve every host, failing on the first error
    pub fn resolve_all<'h>(
        &self,
        hosts: impl IntoIterator<Item = &'h Host>,
    ) -> Result<BTreeMap<String, VariableSet>, ConfigError> {
        hosts
            .into_iter()
            .map(|host| Ok((host.address.clone(), self.resolve(host)?)))
            .collect()
    }
}

/// Dotted path of the first literal credential under `name`, if any
fn literal_credential(name: &str, value: &Value) -> Option<String> {
    match value {
        Value::String(s) if looks_like_credential(name) && !s.is_empty() && !is_templated(s) => {
            Some(name.to_string())
        }
        Value::Number(_) if looks_like_credential(name) => Some(name.to_string()),
        Value::Mapping(map) => map.iter().find_map(|(key, item)| {
            let key = key.as_str()?;
            literal_credential(key, item).map(|path| format!("{name}.{path}"))
        }),
        _ => None,
    }
}
