//! Resolution of raw key/value configuration against a [`ConfigSchema`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::schema::{ConfigSchema, OptionKind, OptionSpec, OptionValue};
use crate::error::{GearError, Result};

/// Configuration after validation against the schema.
///
/// Holds exactly one typed value per schema option.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, OptionValue>,
}

impl ResolvedConfig {
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Boolean value, `false` if absent or of another type.
    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    /// Token list value, empty if absent.
    pub fn list(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(OptionValue::List(items)) => items,
            _ => &[],
        }
    }

    /// Text or enum value, empty if absent.
    pub fn text(&self, name: &str) -> &str {
        match self.values.get(name) {
            Some(OptionValue::Text(s)) | Some(OptionValue::Enum(s)) => s,
            _ => "",
        }
    }

    /// Enum value, `None` if absent or of another type.
    pub fn enum_value(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptionValue::Enum(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(OptionValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(OptionValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Re-serialise into the raw mapping form accepted by [`resolve`].
    pub fn to_raw(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_raw()))
            .collect()
    }
}

/// Validate `raw` against `schema`, filling gaps with defaults.
///
/// Unknown keys are dropped. Empty or whitespace-only list options resolve to
/// an empty list.
pub fn resolve(raw: &Map<String, Value>, schema: &ConfigSchema) -> Result<ResolvedConfig> {
    for key in raw.keys() {
        if schema.get(key).is_none() {
            debug!(option = %key, "Ignoring unknown config option");
        }
    }

    let mut values = BTreeMap::new();
    for spec in schema.options() {
        let value = match raw.get(spec.name) {
            None | Some(Value::Null) => spec.default_value(),
            Some(raw_value) => coerce(spec, raw_value)?,
        };
        values.insert(spec.name.to_string(), value);
    }

    Ok(ResolvedConfig { values })
}

fn coerce(spec: &OptionSpec, raw: &Value) -> Result<OptionValue> {
    let mismatch = || {
        GearError::config(
            spec.name,
            format!("expected {}, got {}", spec.kind.name(), raw),
        )
    };

    match spec.kind {
        OptionKind::String => match raw {
            Value::String(s) => Ok(OptionValue::Text(s.clone())),
            _ => Err(mismatch()),
        },
        OptionKind::StringList => match raw {
            Value::String(s) => Ok(OptionValue::List(
                s.split_whitespace().map(str::to_string).collect(),
            )),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(mismatch))
                .collect::<Result<Vec<_>>>()
                .map(|items| {
                    OptionValue::List(
                        items
                            .iter()
                            .flat_map(|s| s.split_whitespace())
                            .map(str::to_string)
                            .collect(),
                    )
                }),
            _ => Err(mismatch()),
        },
        OptionKind::Boolean => match raw {
            Value::Bool(b) => Ok(OptionValue::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(OptionValue::Bool(true)),
                "false" => Ok(OptionValue::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        OptionKind::Number => match raw {
            Value::Number(n) => n.as_f64().map(OptionValue::Number).ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(OptionValue::Number)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        OptionKind::Integer => match raw {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(OptionValue::Integer(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                            Ok(OptionValue::Integer(f as i64))
                        }
                        _ => Err(mismatch()),
                    }
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(OptionValue::Integer)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        OptionKind::Enum(domain) => match raw {
            Value::String(s) if domain.contains(&s.as_str()) => Ok(OptionValue::Enum(s.clone())),
            Value::String(s) => Err(GearError::config(
                spec.name,
                format!("value '{}' not in [{}]", s, domain.join(", ")),
            )),
            _ => Err(mismatch()),
        },
    }
}
