//! Custom filters for templates and task parameters

use base64::Engine;
use minijinja::{Environment, Error, ErrorKind, Value as JinjaValue};
use std::path::Path;

/// Add all custom filters to the minijinja environment
pub fn add_filters(env: &mut Environment) {
    env.add_filter("basename", |value: JinjaValue| {
        let path_str = value.as_str().unwrap_or("");
        if path_str.ends_with('/') && path_str != "/" {
            // For paths ending with / (except root), basename is empty
            String::new()
        } else {
            Path::new(path_str)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string()
        }
    });

    env.add_filter("dirname", |value: JinjaValue| {
        let path_str = value.as_str().unwrap_or("");
        if path_str.ends_with('/') {
            return path_str.trim_end_matches('/').to_string();
        }
        Path::new(path_str)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or("")
            .to_string()
    });

    // POSIX shell quoting for values spliced into `command` tasks
    env.add_filter("quote", |value: JinjaValue| -> Result<String, Error> {
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        shlex::try_quote(&text)
            .map(|quoted| quoted.into_owned())
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });

    env.add_filter("b64encode", |value: JinjaValue| {
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
    });
}
