//! Per-host variable sets and secret redaction
//!
//! A [`VariableSet`] is the fully merged mapping a host's tasks are rendered
//! against. It remembers which names were declared secret so that their values
//! can be scrubbed from anything the runner prints.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::Value;

/// Replacement text for redacted values
pub const MASK: &str = "********";

/// Secret values shorter than this are not scrubbed from free text
const MIN_REDACTED_LEN: usize = 4;

/// Variable storage for one host
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    values: BTreeMap<String, Value>,
    secret_names: BTreeSet<String>,
    secret_values: Vec<String>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable value, replacing any earlier layer
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Overlay a whole layer
    pub fn merge<'a>(&mut self, layer: impl IntoIterator<Item = (&'a String, &'a Value)>) {
        for (key, value) in layer {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Declare a variable secret; its value is redacted wherever it appears
    pub fn mark_secret(&mut self, name: impl Into<String>) {
        self.secret_names.insert(name.into());
    }

    /// Redact a value that is not a whole variable, such as a password hash
    /// nested in a record
    pub fn add_secret_value(&mut self, value: impl Into<String>) {
        self.secret_values.push(value.into());
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.secret_names.contains(name)
    }

    /// Build a redactor for every secret value in this set
    pub fn redactor(&self) -> Redactor {
        let mut needles = self.secret_values.clone();
        for name in &self.secret_names {
            if let Some(value) = self.values.get(name) {
                collect_leaves(value, &mut needles);
            }
        }
        Redactor::new(needles)
    }

    /// Template context for this set
    pub fn to_context(&self) -> minijinja::Value {
        minijinja::Value::from_serialize(&self.values)
    }

    /// Template context with one extra binding, used for loop items
    pub fn context_with(&self, name: &str, value: &Value) -> minijinja::Value {
        let mut values = self.values.clone();
        values.insert(name.to_string(), value.clone());
        minijinja::Value::from_serialize(&values)
    }

    /// Copy with secret variables masked, suitable for printing
    pub fn redacted(&self) -> BTreeMap<String, Value> {
        let redactor = self.redactor();
        self.values
            .iter()
            .map(|(key, value)| {
                let shown = if self.is_secret(key) {
                    Value::String(MASK.to_string())
                } else {
                    redactor.redact_value(value)
                };
                (key.clone(), shown)
            })
            .collect()
    }
}

fn collect_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Sequence(items) => items.iter().for_each(|item| collect_leaves(item, out)),
        Value::Mapping(map) => map.values().for_each(|item| collect_leaves(item, out)),
        Value::Tagged(tagged) => collect_leaves(&tagged.value, out),
        Value::Bool(_) | Value::Null => {}
    }
}

/// Scrubs known secret values out of text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    needles: Vec<String>,
}

impl Redactor {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        let mut needles: Vec<String> = values
            .into_iter()
            .filter(|v| v.len() >= MIN_REDACTED_LEN)
            .collect();
        // longest first so a secret containing another is masked whole
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();
        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), MASK);
            }
        }
        out
    }

    /// Redact every string inside a structured value
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Sequence(items) => {
                Value::Sequence(items.iter().map(|item| self.redact_value(item)).collect())
            }
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
