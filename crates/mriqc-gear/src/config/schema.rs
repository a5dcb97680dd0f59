//! Declared option schema for the gear configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Freeform string.
    String,
    /// String interpreted as a whitespace-separated token list.
    StringList,
    Boolean,
    Number,
    Integer,
    /// String drawn from a closed domain.
    Enum(&'static [&'static str]),
}

impl OptionKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptionKind::String => "string",
            OptionKind::StringList => "string list",
            OptionKind::Boolean => "boolean",
            OptionKind::Number => "number",
            OptionKind::Integer => "integer",
            OptionKind::Enum(_) => "enum",
        }
    }
}

/// A typed configuration value.
///
/// Enumerated values and freeform strings are distinct variants so that
/// downstream code never has to guess which one it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OptionValue {
    Text(String),
    Enum(String),
    List(Vec<String>),
    Bool(bool),
    Number(f64),
    Integer(i64),
}

impl OptionValue {
    /// Raw JSON form, as it would appear in a gear config file.
    pub fn to_raw(&self) -> Value {
        match self {
            OptionValue::Text(s) | OptionValue::Enum(s) => Value::String(s.clone()),
            OptionValue::List(items) => Value::String(items.join(" ")),
            OptionValue::Bool(b) => Value::Bool(*b),
            OptionValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            OptionValue::Integer(i) => Value::from(*i),
        }
    }
}

/// Default value of an option, stored in a `const`-friendly form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Str(&'static str),
    Bool(bool),
    Number(f64),
    Integer(i64),
}

/// One row of the schema table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: DefaultValue,
}

impl OptionSpec {
    const fn new(name: &'static str, kind: OptionKind, default: DefaultValue) -> Self {
        Self {
            name,
            kind,
            default,
        }
    }

    /// The default as a typed value.
    pub fn default_value(&self) -> OptionValue {
        match (self.kind, self.default) {
            (OptionKind::StringList, DefaultValue::Str(s)) => {
                OptionValue::List(s.split_whitespace().map(str::to_string).collect())
            }
            (OptionKind::Enum(_), DefaultValue::Str(s)) => OptionValue::Enum(s.to_string()),
            (_, DefaultValue::Str(s)) => OptionValue::Text(s.to_string()),
            (_, DefaultValue::Bool(b)) => OptionValue::Bool(b),
            (_, DefaultValue::Number(n)) => OptionValue::Number(n),
            (_, DefaultValue::Integer(i)) => OptionValue::Integer(i),
        }
    }
}

pub const LOG_LEVELS: &[&str] = &["INFO", "DEBUG"];
pub const VERBOSITY: &[&str] = &["", "v", "vv", "vvv"];

use DefaultValue as D;
use OptionKind as K;

static MRIQC_OPTIONS: &[OptionSpec] = &[
    // gear-level options, never forwarded to the tool
    OptionSpec::new("gear-log-level", K::Enum(LOG_LEVELS), D::Str("INFO")),
    OptionSpec::new("gear-dry-run", K::Boolean, D::Bool(false)),
    OptionSpec::new("gear-run-bids-validation", K::Boolean, D::Bool(true)),
    OptionSpec::new("gear-abort-on-bids-error", K::Boolean, D::Bool(true)),
    OptionSpec::new("gear-save-intermediate-output", K::Boolean, D::Bool(false)),
    OptionSpec::new("gear-intermediate-files", K::StringList, D::Str("")),
    OptionSpec::new("gear-intermediate-folders", K::StringList, D::Str("")),
    OptionSpec::new("gear-keep-output", K::Boolean, D::Bool(false)),
    // tool options
    OptionSpec::new("bids_app_args", K::String, D::Str("")),
    OptionSpec::new("participant_label", K::StringList, D::Str("")),
    OptionSpec::new("session-id", K::StringList, D::Str("")),
    OptionSpec::new("run-id", K::StringList, D::Str("")),
    OptionSpec::new("task-id", K::StringList, D::Str("")),
    OptionSpec::new("modalities", K::StringList, D::Str("")),
    OptionSpec::new("dsname", K::String, D::Str("")),
    OptionSpec::new("verbose", K::Enum(VERBOSITY), D::Str("")),
    OptionSpec::new("verbose-reports", K::Boolean, D::Bool(false)),
    OptionSpec::new("write-graph", K::Boolean, D::Bool(false)),
    OptionSpec::new("no-sub", K::Boolean, D::Bool(false)),
    OptionSpec::new("datalad-get", K::Boolean, D::Bool(true)),
    OptionSpec::new("fd_thres", K::Number, D::Number(0.2)),
    OptionSpec::new("start-idx", K::Integer, D::Integer(0)),
    OptionSpec::new("stop-idx", K::Integer, D::Integer(0)),
    OptionSpec::new("hmc-afni", K::Boolean, D::Bool(false)),
    OptionSpec::new("hmc-fsl", K::Boolean, D::Bool(false)),
    OptionSpec::new("fft-spikes-detector", K::Boolean, D::Bool(false)),
    OptionSpec::new("ica", K::Boolean, D::Bool(false)),
    OptionSpec::new("deoblique", K::Boolean, D::Bool(false)),
    OptionSpec::new("despike", K::Boolean, D::Bool(false)),
    OptionSpec::new("correct-slice-timing", K::Boolean, D::Bool(false)),
    // accepted but never forwarded: the tool detects its own maximums
    OptionSpec::new("n_cpus", K::Integer, D::Integer(0)),
    OptionSpec::new("mem_gb", K::Integer, D::Integer(0)),
];

/// The set of options a gear accepts.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSchema {
    options: &'static [OptionSpec],
}

impl ConfigSchema {
    /// Schema of the bids-mriqc gear.
    pub fn mriqc() -> Self {
        Self {
            options: MRIQC_OPTIONS,
        }
    }

    /// Build a schema from an arbitrary static table.
    pub fn from_table(options: &'static [OptionSpec]) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &'static [OptionSpec] {
        self.options
    }

    pub fn get(&self, name: &str) -> Option<&'static OptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }
}
