//! Environment overlay for the wrapped tool.
//!
//! The container bakes its environment (tool paths, FreeSurfer/FSL/AFNI
//! variables, thread limits) into a JSON file at build time. The overlay is
//! applied to the child process only; the harness never mutates its own
//! process environment.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GearError, Result};

/// Default location of the baked environment file inside the container.
pub const DEFAULT_ENVIRONMENT_FILE: &str = "/tmp/gear_environ.json";

const ENVIRONMENT_OPTION: &str = "environment-file";

/// Read-only set of environment variables passed explicitly to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvironmentOverlay {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Load the overlay from a JSON object of string values.
    ///
    /// A missing file yields an empty overlay. A file that cannot be read or
    /// parsed is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Environment file not found, using empty overlay");
            return Ok(Self::default());
        }

        let invalid =
            |e: &dyn std::fmt::Display| GearError::config(ENVIRONMENT_OPTION, format!("{}: {e}", path.display()));
        let data = std::fs::read_to_string(path).map_err(|e| invalid(&e))?;
        let overlay: Self = serde_json::from_str(&data).map_err(|e| invalid(&e))?;

        let rendered = overlay
            .vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(environment = %rendered, "Loaded environment overlay");

        Ok(overlay)
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
