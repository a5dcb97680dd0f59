//! Gear configuration: declared schema, typed resolution and the gear-level view.
//!
//! - [`schema`]: `ConfigSchema`, `OptionSpec`, `OptionValue`
//! - [`resolve`]: `resolve()` and `ResolvedConfig`

pub mod resolve;
pub mod schema;

use serde_json::{Map, Value};
use tracing::Level;

pub use resolve::{resolve, ResolvedConfig};
pub use schema::{ConfigSchema, DefaultValue, OptionKind, OptionSpec, OptionValue};

use crate::artifacts::RetentionSpec;
use crate::error::{GearError, Result};

/// Typed view of the `gear-*` options, which steer the harness rather than
/// the wrapped tool.
#[derive(Debug, Clone, PartialEq)]
pub struct GearOptions {
    pub log_level: Level,
    pub dry_run: bool,
    pub run_validation: bool,
    pub abort_on_bids_error: bool,
    pub retention: RetentionSpec,
    pub keep_output: bool,
}

impl GearOptions {
    pub fn from_resolved(cfg: &ResolvedConfig) -> Self {
        let log_level = if cfg.enum_value("gear-log-level") == Some("DEBUG") {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            log_level,
            dry_run: cfg.bool("gear-dry-run"),
            run_validation: cfg.bool("gear-run-bids-validation"),
            abort_on_bids_error: cfg.bool("gear-abort-on-bids-error"),
            retention: RetentionSpec::new(
                cfg.list("gear-intermediate-files").iter().cloned(),
                cfg.list("gear-intermediate-folders").iter().cloned(),
                cfg.bool("gear-save-intermediate-output"),
            ),
            keep_output: cfg.bool("gear-keep-output"),
        }
    }
}

/// Extract the option mapping from a gear config document.
///
/// Accepts either a flat mapping or a manifest-style document whose options
/// live under a top-level `"config"` object.
pub fn config_section(document: &Value) -> Result<Map<String, Value>> {
    let root = document
        .as_object()
        .ok_or_else(|| GearError::config("<root>", "config document must be a JSON object"))?;

    match root.get("config") {
        Some(Value::Object(section)) => Ok(section.clone()),
        Some(_) => Err(GearError::config("config", "expected a JSON object")),
        None => Ok(root.clone()),
    }
}
