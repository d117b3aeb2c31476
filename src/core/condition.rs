//! Comparison operators evaluated by condition nodes

use crate::core::error::ActionError;
use crate::core::template::stringify;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Operator applied to `(value, compareValue)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Gt,
    Lt,
    Gte,
    Lte,
    IsEmpty,
    IsNotEmpty,
    Regex,
}

impl FromStr for ConditionOperator {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "equals" | "==" => ConditionOperator::Equals,
            "not_equals" | "!=" => ConditionOperator::NotEquals,
            "contains" => ConditionOperator::Contains,
            "not_contains" => ConditionOperator::NotContains,
            "gt" | ">" => ConditionOperator::Gt,
            "lt" | "<" => ConditionOperator::Lt,
            "gte" | ">=" => ConditionOperator::Gte,
            "lte" | "<=" => ConditionOperator::Lte,
            "is_empty" => ConditionOperator::IsEmpty,
            "is_not_empty" => ConditionOperator::IsNotEmpty,
            "regex" => ConditionOperator::Regex,
            other => {
                return Err(ActionError::InvalidInput(format!(
                    "unknown condition operator '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }
}

impl ConditionOperator {
    /// Evaluate the operator; only `regex` can fail, on a bad pattern
    pub fn evaluate(self, value: &Value, compare: &Value) -> Result<bool, ActionError> {
        let result = match self {
            ConditionOperator::Equals => loose_eq(value, compare),
            ConditionOperator::NotEquals => !loose_eq(value, compare),
            ConditionOperator::Contains => stringify(value).contains(&stringify(compare)),
            ConditionOperator::NotContains => !stringify(value).contains(&stringify(compare)),
            ConditionOperator::Gt => compare_numbers(value, compare, |a, b| a > b),
            ConditionOperator::Lt => compare_numbers(value, compare, |a, b| a < b),
            ConditionOperator::Gte => compare_numbers(value, compare, |a, b| a >= b),
            ConditionOperator::Lte => compare_numbers(value, compare, |a, b| a <= b),
            ConditionOperator::IsEmpty => is_empty(value),
            ConditionOperator::IsNotEmpty => !is_empty(value),
            ConditionOperator::Regex => {
                let pattern = stringify(compare);
                let regex = Regex::new(&pattern).map_err(|e| {
                    ActionError::InvalidInput(format!("invalid regex '{}': {}", pattern, e))
                })?;
                regex.is_match(&stringify(value))
            }
        };
        Ok(result)
    }
}

/// Numeric form of a value: numbers as-is, trimmed numeric strings, booleans as 0/1
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse().ok()
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare_numbers(value: &Value, compare: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (to_number(value), to_number(compare)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Equality with scalar coercion: `"1" == 1`, `true == 1`, `null == null`
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => a == b,
        _ => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Falsy scalars (`null`, `false`, `0`, `""`) or an empty array
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0 || f.is_nan()),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(_) => false,
    }
}
