//! Execution context - step outputs keyed by step id, plus the trigger payload

use crate::core::graph::TRIGGER_KEY;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// A dotted path that walked into something v1 cannot address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path '{path}' indexes into an array at segment '{segment}'; array indexing is not supported")]
    ArrayIndex { path: String, segment: String },
}

/// Accumulated outputs of one execution
///
/// Keys are step ids; [`TRIGGER_KEY`] holds the initiating payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: BTreeMap<String, Value>,
}

impl ExecutionContext {
    /// Create a context seeded with the trigger payload
    pub fn new(trigger: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(TRIGGER_KEY.to_string(), trigger);
        Self { values }
    }

    pub fn trigger(&self) -> &Value {
        self.values.get(TRIGGER_KEY).unwrap_or(&Value::Null)
    }

    /// Record a step's output; a later write for the same step replaces it
    pub fn set_step_output(&mut self, step_id: &str, output: Value) {
        self.values.insert(step_id.to_string(), output);
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        if step_id == TRIGGER_KEY {
            return None;
        }
        self.values.get(step_id)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Walk the context by dot-separated segments
    ///
    /// Returns `Ok(None)` on a miss and an error when a segment would have
    /// to index into an array.
    pub fn lookup(&self, path: &str) -> Result<Option<&Value>, PathError> {
        let mut segments = path.split('.').map(str::trim);
        let head = match segments.next() {
            Some(head) if !head.is_empty() => head,
            _ => return Ok(None),
        };

        let mut current = match self.values.get(head) {
            Some(value) => value,
            None => return Ok(None),
        };

        for segment in segments {
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(value) => value,
                    None => return Ok(None),
                },
                Value::Array(_) => {
                    return Err(PathError::ArrayIndex {
                        path: path.to_string(),
                        segment: segment.to_string(),
                    })
                }
                _ => return Ok(None),
            };
        }

        Ok(Some(current))
    }
}
