//! Template renderer
//!
//! A single shared minijinja environment with strict undefined handling.
//! Rendering has no side effects, so it is safe to call speculatively when
//! hashing content or computing a check-mode plan.

pub mod filters;

use std::path::Path;

use minijinja::{Environment, UndefinedBehavior};
use serde_yaml::Value;

use crate::error::TemplateError;

/// Whether a string carries template syntax
pub fn is_templated(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// The expression of a string made of exactly one `{{ ... }}` block
fn single_expression(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

fn stringify_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(stringify_numbers).collect()),
        other => other,
    }
}

/// Set up minijinja environment with custom filters
pub fn setup_minijinja_env(env: &mut Environment) {
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    filters::add_filters(env);
}

/// Renders templates, task parameters and `when:` expressions
#[derive(Debug)]
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        setup_minijinja_env(&mut env);
        Self { env }
    }

    /// Render template source; `name` identifies it in errors
    pub fn render_str(
        &self,
        name: &str,
        source: &str,
        context: &minijinja::Value,
    ) -> Result<String, TemplateError> {
        self.env
            .render_named_str(name, source, context)
            .map_err(|e| TemplateError::from_minijinja(name, &e))
    }

    /// Render a template file from disk
    pub fn render_file(
        &self,
        path: &Path,
        context: &minijinja::Value,
    ) -> Result<String, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        self.render_str(&path.display().to_string(), &source, context)
    }

    /// Render every templated string inside a structured value
    ///
    /// A string that is exactly one `{{ expr }}` keeps the native type of the
    /// expression, so `groups: "{{ item.groups }}"` yields a list and
    /// `"{{ none }}"` yields null. Numbers become strings.
    pub fn render_value(
        &self,
        name: &str,
        value: &Value,
        context: &minijinja::Value,
    ) -> Result<Value, TemplateError> {
        Ok(match value {
            Value::String(s) if is_templated(s) => match single_expression(s) {
                Some(expr) => self.eval_native(name, expr, context)?,
                None => Value::String(self.render_str(name, s, context)?),
            },
            Value::Sequence(items) => Value::Sequence(
                items
                    .iter()
                    .map(|item| self.render_value(name, item, context))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Mapping(map) => {
                let mut rendered = serde_yaml::Mapping::new();
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(name, item, context)?);
                }
                Value::Mapping(rendered)
            }
            other => other.clone(),
        })
    }

    fn eval_native(
        &self,
        name: &str,
        expression: &str,
        context: &minijinja::Value,
    ) -> Result<Value, TemplateError> {
        let compiled = self
            .env
            .compile_expression(expression)
            .map_err(|e| TemplateError::from_minijinja(name, &e))?;
        let value = compiled
            .eval(context)
            .map_err(|e| TemplateError::from_minijinja(name, &e))?;
        if value.is_undefined() {
            return Err(TemplateError::Undefined {
                template: name.to_string(),
                detail: format!("'{expression}' is undefined"),
            });
        }
        let native = serde_yaml::to_value(&value).map_err(|e| TemplateError::Render {
            template: name.to_string(),
            detail: e.to_string(),
        })?;
        Ok(stringify_numbers(native))
    }

    /// Evaluate a `when:` expression; `{{ }}` around it is tolerated
    pub fn eval_condition(
        &self,
        name: &str,
        expression: &str,
        context: &minijinja::Value,
    ) -> Result<bool, TemplateError> {
        let trimmed = expression.trim();
        let bare = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed)
            .trim();
        let compiled = self
            .env
            .compile_expression(bare)
            .map_err(|e| TemplateError::from_minijinja(name, &e))?;
        let value = compiled
            .eval(context)
            .map_err(|e| TemplateError::from_minijinja(name, &e))?;
        Ok(value.is_true())
    }
}
