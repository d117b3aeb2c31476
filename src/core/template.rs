//! Template resolution - expands `{{dotted.path}}` references in node inputs

use crate::core::context::{ExecutionContext, PathError};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::warn;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("marker pattern is valid")
});

/// Resolved inputs plus anything that could not be resolved cleanly
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub values: Map<String, Value>,
    pub warnings: Vec<PathError>,
}

/// Resolve every value of a node's input configuration against the context
///
/// Nested mappings and arrays keep their structure. A lookup miss is not an
/// error here: whole-value markers resolve to `null`, embedded markers to
/// the empty string.
pub fn resolve_inputs(inputs: &Map<String, Value>, context: &ExecutionContext) -> Resolved {
    let mut warnings = Vec::new();
    let values = inputs
        .iter()
        .map(|(key, value)| (key.clone(), resolve(value, context, &mut warnings)))
        .collect();

    for warning in &warnings {
        warn!("Template resolution: {}", warning);
    }

    Resolved { values, warnings }
}

/// Resolve a single value, discarding warnings
pub fn resolve_value(value: &Value, context: &ExecutionContext) -> Value {
    resolve(value, context, &mut Vec::new())
}

fn resolve(value: &Value, context: &ExecutionContext, warnings: &mut Vec<PathError>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, context, warnings),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, context, warnings)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve(v, context, warnings))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, context: &ExecutionContext, warnings: &mut Vec<PathError>) -> Value {
    // Whole-value marker keeps the native type found at the path
    if let Some(path) = whole_marker(s) {
        return lookup(path, context, warnings).cloned().unwrap_or(Value::Null);
    }

    if !MARKER.is_match(s) {
        return Value::String(s.to_string());
    }

    let rendered = MARKER.replace_all(s, |caps: &regex::Captures<'_>| {
        lookup(&caps[1], context, warnings)
            .map(stringify)
            .unwrap_or_default()
    });
    Value::String(rendered.into_owned())
}

/// The path of `s` when `s` is exactly one marker
fn whole_marker(s: &str) -> Option<&str> {
    let caps = MARKER.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn lookup<'a>(
    path: &str,
    context: &'a ExecutionContext,
    warnings: &mut Vec<PathError>,
) -> Option<&'a Value> {
    match context.lookup(path) {
        Ok(found) => found,
        Err(err) => {
            warnings.push(err);
            None
        }
    }
}

/// String form of a value as it appears inside a larger string
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
