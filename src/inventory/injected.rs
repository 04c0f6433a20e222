//! Externally injected variables
//!
//! Values arrive at run time from `--extra-vars-file` files, prefixed
//! environment variables and `-e NAME=VALUE` pairs, later sources overriding
//! earlier ones. A playbook may declare the shape each injected name must
//! have and whether its value is secret.

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::error::ConfigError;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

static CRYPT_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$[0-9a-z]{1,3}\$[^\s:]+$").expect("valid regex"));

/// Whether a name is acceptable to `useradd`
pub fn is_valid_username(name: &str) -> bool {
    USERNAME_RE.is_match(name)
}

/// Whether a password value is a crypt(3) hash rather than plaintext
pub fn is_crypt_hash(value: &str) -> bool {
    CRYPT_HASH_RE.is_match(value)
}

/// Expected structure of an injected value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    String,
    Integer,
    Boolean,
    List,
    Mapping,
    /// A list of [`AccountRecord`]s
    Accounts,
}

fn default_required() -> bool {
    true
}

/// Declaration of one injected variable in a playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectedDecl {
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub secret: bool,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Default for InjectedDecl {
    fn default() -> Self {
        Self {
            shape: Shape::String,
            secret: false,
            required: true,
        }
    }
}

/// An OS account to ensure, as injected by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountRecord {
    pub name: String,
    /// crypt(3) hash only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Where injected values come from
#[derive(Debug, Clone, Default)]
pub struct InjectedSources {
    pub files: Vec<PathBuf>,
    pub env_prefix: String,
    /// Raw `NAME=VALUE` pairs
    pub pairs: Vec<String>,
}

/// Injected values after collection, and after validation their normalised form
#[derive(Debug, Clone, Default)]
pub struct InjectedVars {
    values: BTreeMap<String, Value>,
    secret_names: Vec<String>,
    secret_values: Vec<String>,
}

impl InjectedVars {
    /// Gather values from every source; `env` is usually `std::env::vars()`
    pub fn collect(
        sources: &InjectedSources,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut values = BTreeMap::new();

        for path in &sources.files {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            // JSON is a subset of YAML
            let parsed: BTreeMap<String, Value> =
                serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            debug!(path = %path.display(), count = parsed.len(), "loaded extra vars file");
            values.extend(parsed);
        }

        if !sources.env_prefix.is_empty() {
            let mut from_env: Vec<(String, String)> = env
                .into_iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&sources.env_prefix)
                        .filter(|name| !name.is_empty())
                        .map(|name| (name.to_lowercase(), value))
                })
                .collect();
            from_env.sort();
            for (name, value) in from_env {
                values.insert(name, Value::String(value));
            }
        }

        for pair in &sources.pairs {
            let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidInjected {
                name: pair.clone(),
                message: "expected NAME=VALUE".to_string(),
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidInjected {
                    name: pair.clone(),
                    message: "empty variable name".to_string(),
                });
            }
            values.insert(name.to_string(), Value::String(value.to_string()));
        }

        Ok(Self {
            values,
            ..Self::default()
        })
    }

    /// Build directly from values, for callers that already hold them
    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    /// Coerce every declared value to its shape and record secrets
    pub fn validate(&mut self, decls: &BTreeMap<String, InjectedDecl>) -> Result<(), ConfigError> {
        for (name, decl) in decls {
            if decl.secret {
                self.secret_names.push(name.clone());
            }
            let Some(raw) = self.values.get(name) else {
                continue;
            };
            let (value, hashes) = coerce(name, raw, decl.shape)?;
            self.secret_values.extend(hashes);
            self.values.insert(name.clone(), value);
        }
        Ok(())
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn secret_names(&self) -> &[String] {
        &self.secret_names
    }

    /// Values to redact that are not whole variables, such as password hashes
    pub fn secret_values(&self) -> &[String] {
        &self.secret_values
    }
}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidInjected {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Strings supplied for structured shapes are parsed as YAML first
///
/// Parser messages can quote the input, so only the location is reported.
fn structured(name: &str, raw: &Value) -> Result<Value, ConfigError> {
    match raw {
        Value::String(s) => serde_yaml::from_str(s).map_err(|e| match e.location() {
            Some(at) => invalid(
                name,
                format!("not valid YAML at line {} column {}", at.line(), at.column()),
            ),
            None => invalid(name, "not valid YAML"),
        }),
        other => Ok(other.clone()),
    }
}

/// Typed account records; errors name the field, never its value
fn account_records(name: &str, value: &Value) -> Result<Vec<AccountRecord>, ConfigError> {
    let Value::Sequence(items) = value else {
        return Err(invalid(name, "expected a list of accounts"));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            serde_yaml::from_value(item.clone())
                .map_err(|_| invalid(name, format!("{name}[{index}]{}", account_problem(item))))
        })
        .collect()
}

fn account_problem(item: &Value) -> String {
    let Value::Mapping(map) = item else {
        return ": expected a mapping".to_string();
    };
    for (key, value) in map {
        let Some(key) = key.as_str() else {
            return ": field names must be strings".to_string();
        };
        let expected = match key {
            "name" if !value.is_string() => "a string",
            "password" | "shell" if !(value.is_string() || value.is_null()) => "a string",
            "groups" if !value
                .as_sequence()
                .is_some_and(|groups| groups.iter().all(Value::is_string)) =>
            {
                "a list of strings"
            }
            "name" | "password" | "shell" | "groups" => continue,
            _ => return format!(": unknown field '{key}'"),
        };
        return format!(".{key}: expected {expected}");
    }
    if !map.contains_key("name") {
        return ".name: missing".to_string();
    }
    ": not a valid account".to_string()
}

fn coerce(name: &str, raw: &Value, shape: Shape) -> Result<(Value, Vec<String>), ConfigError> {
    let value = match shape {
        Shape::String => match raw {
            Value::String(_) => raw.clone(),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            _ => return Err(invalid(name, "expected a string")),
        },
        Shape::Integer => match structured(name, raw)? {
            Value::Number(n) if n.is_i64() || n.is_u64() => Value::Number(n),
            _ => return Err(invalid(name, "expected an integer")),
        },
        Shape::Boolean => match structured(name, raw)? {
            Value::Bool(b) => Value::Bool(b),
            _ => return Err(invalid(name, "expected true or false")),
        },
        Shape::List => match structured(name, raw)? {
            Value::Sequence(items) => Value::Sequence(items),
            _ => return Err(invalid(name, "expected a list")),
        },
        Shape::Mapping => match structured(name, raw)? {
            Value::Mapping(map) => Value::Mapping(map),
            _ => return Err(invalid(name, "expected a mapping")),
        },
        Shape::Accounts => {
            let records = account_records(name, &structured(name, raw)?)?;
            let hashes = check_accounts(name, &records)?;
            let value = serde_yaml::to_value(&records)
                .map_err(|e| invalid(name, e.to_string()))?;
            return Ok((value, hashes));
        }
    };
    Ok((value, Vec::new()))
}

fn check_accounts(name: &str, records: &[AccountRecord]) -> Result<Vec<String>, ConfigError> {
    let mut hashes = Vec::new();
    for record in records {
        if !is_valid_username(&record.name) {
            return Err(invalid(
                name,
                format!("'{}' is not a valid user name", record.name),
            ));
        }
        if let Some(password) = &record.password {
            if !is_crypt_hash(password) {
                // never echo the offending value
                return Err(invalid(
                    name,
                    format!(
                        "account '{}' carries a plaintext password; supply a crypt hash such as $6$...",
                        record.name
                    ),
                ));
            }
            hashes.push(password.clone());
        }
    }
    Ok(hashes)
}
