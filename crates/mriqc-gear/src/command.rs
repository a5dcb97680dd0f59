//! Table-driven construction of the MRIQC command line.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ConfigSchema, OptionValue, ResolvedConfig};
use crate::environment::EnvironmentOverlay;
use crate::error::{GearError, Result};

/// Default executable of the wrapped tool.
pub const DEFAULT_TOOL: &str = "mriqc";

/// How a flag is derived from its option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Bare flag when true, nothing when false.
    OmitIfFalse,
    /// Nothing when true (the tool's own default), the given flag when false.
    NegateIfFalse(&'static str),
    /// Lists as `--flag a b`, strings as `--flag=value`; nothing when empty.
    OmitIfEmpty,
    /// `--flag=value` unless the value equals the schema default.
    OmitIfDefault,
    /// `--flag=value` unconditionally.
    Always,
    /// Repetition count: `vv` becomes `-vv`.
    Count,
}

/// One row of the flag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagRule {
    pub option: &'static str,
    pub flag: &'static str,
    pub emission: Emission,
}

const fn rule(option: &'static str, flag: &'static str, emission: Emission) -> FlagRule {
    FlagRule {
        option,
        flag,
        emission,
    }
}

/// Tool flags in emission order. Gear-level options and resource limits are
/// deliberately absent.
pub static FLAG_TABLE: &[FlagRule] = &[
    rule("participant_label", "--participant_label", Emission::OmitIfEmpty),
    rule("session-id", "--session-id", Emission::OmitIfEmpty),
    rule("run-id", "--run-id", Emission::OmitIfEmpty),
    rule("task-id", "--task-id", Emission::OmitIfEmpty),
    rule("modalities", "--modalities", Emission::OmitIfEmpty),
    rule("dsname", "--dsname", Emission::OmitIfEmpty),
    rule("verbose", "-v", Emission::Count),
    rule("verbose-reports", "--verbose-reports", Emission::OmitIfFalse),
    rule("write-graph", "--write-graph", Emission::OmitIfFalse),
    rule("no-sub", "--no-sub", Emission::OmitIfFalse),
    rule("datalad-get", "--datalad-get", Emission::NegateIfFalse("--no-datalad-get")),
    rule("fd_thres", "--fd_thres", Emission::Always),
    rule("start-idx", "--start-idx", Emission::OmitIfDefault),
    rule("stop-idx", "--stop-idx", Emission::OmitIfDefault),
    rule("hmc-afni", "--hmc-afni", Emission::OmitIfFalse),
    rule("hmc-fsl", "--hmc-fsl", Emission::OmitIfFalse),
    rule("fft-spikes-detector", "--fft-spikes-detector", Emission::OmitIfFalse),
    rule("ica", "--ica", Emission::OmitIfFalse),
    rule("deoblique", "--deoblique", Emission::OmitIfFalse),
    rule("despike", "--despike", Emission::OmitIfFalse),
    rule("correct-slice-timing", "--correct-slice-timing", Emission::OmitIfFalse),
];

/// Boolean options that may not both be enabled.
pub static CONFLICTS: &[(&str, &str)] = &[("hmc-afni", "hmc-fsl")];

/// Flags that limit the tool's CPU or memory use. The tool is left to detect
/// its own maximums, so none of these ever reach the command line.
pub static RESOURCE_FLAGS: &[&str] = &[
    "--n_procs",
    "--nprocs",
    "--n_cpus",
    "--n-cpus",
    "--omp-nthreads",
    "--mem_gb",
    "--mem-gb",
    "--mem",
    "--ants-nthreads",
];

/// Option holding verbatim extra arguments for the tool.
const PASSTHROUGH_OPTION: &str = "bids_app_args";

/// Shortest flag abbreviation, after `--`, treated as a resource flag.
const MIN_ABBREVIATION: usize = 3;

/// Whether a token names a resource-limit flag (with or without `=value`).
///
/// The tool's argument parser accepts unambiguous prefixes of long flags, so
/// abbreviations such as `--nproc` count too.
pub fn is_resource_flag(token: &str) -> bool {
    let name = token.split('=').next().unwrap_or(token);
    if RESOURCE_FLAGS.contains(&name) {
        return true;
    }
    let Some(stem) = name.strip_prefix("--") else {
        return false;
    };
    stem.len() >= MIN_ABBREVIATION && RESOURCE_FLAGS.iter().any(|flag| flag.starts_with(name))
}

/// BIDS-Apps analysis level, the third positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLevel {
    Participant,
    Group,
}

impl AnalysisLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisLevel::Participant => "participant",
            AnalysisLevel::Group => "group",
        }
    }
}

/// Directories the tool reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GearPaths {
    pub bids_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// A fully built tool invocation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    env: EnvironmentOverlay,
}

impl ToolInvocation {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        env: EnvironmentOverlay,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            env,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn env(&self) -> &EnvironmentOverlay {
        &self.env
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Maps a [`ResolvedConfig`] onto the tool's command line.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    schema: ConfigSchema,
    env: EnvironmentOverlay,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL)
    }
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            schema: ConfigSchema::mriqc(),
            env: EnvironmentOverlay::default(),
        }
    }

    pub fn with_environment(mut self, env: EnvironmentOverlay) -> Self {
        self.env = env;
        self
    }

    /// Build the participant-level invocation.
    pub fn build(&self, cfg: &ResolvedConfig, paths: &GearPaths) -> Result<ToolInvocation> {
        self.build_for_level(cfg, paths, AnalysisLevel::Participant)
    }

    pub fn build_for_level(
        &self,
        cfg: &ResolvedConfig,
        paths: &GearPaths,
        level: AnalysisLevel,
    ) -> Result<ToolInvocation> {
        check_conflicts(cfg)?;

        let mut args = vec![
            paths.bids_dir.to_string_lossy().into_owned(),
            paths.output_dir.to_string_lossy().into_owned(),
            level.as_str().to_string(),
        ];

        for rule in FLAG_TABLE {
            self.emit(rule, cfg, &mut args);
        }

        args.extend(passthrough_args(cfg.text(PASSTHROUGH_OPTION)));

        let invocation =
            ToolInvocation::new(&self.program, args, &paths.work_dir, self.env.clone());
        info!(level = level.as_str(), "command is: {}", invocation);
        Ok(invocation)
    }

    fn emit(&self, rule: &FlagRule, cfg: &ResolvedConfig, args: &mut Vec<String>) {
        let Some(value) = cfg.get(rule.option) else {
            return;
        };

        match rule.emission {
            Emission::OmitIfFalse => {
                if matches!(value, OptionValue::Bool(true)) {
                    args.push(rule.flag.to_string());
                }
            }
            Emission::NegateIfFalse(negated) => {
                if matches!(value, OptionValue::Bool(false)) {
                    args.push(negated.to_string());
                }
            }
            Emission::OmitIfEmpty => match value {
                OptionValue::List(items) if !items.is_empty() => {
                    args.push(rule.flag.to_string());
                    args.extend(items.iter().cloned());
                }
                OptionValue::Text(s) | OptionValue::Enum(s) if !s.trim().is_empty() => {
                    args.push(format!("{}={}", rule.flag, s.trim()));
                }
                _ => {}
            },
            Emission::OmitIfDefault => {
                let is_default = self
                    .schema
                    .get(rule.option)
                    .map(|spec| spec.default_value() == *value)
                    .unwrap_or(false);
                if !is_default {
                    if let Some(rendered) = scalar(value) {
                        args.push(format!("{}={}", rule.flag, rendered));
                    }
                }
            }
            Emission::Always => {
                if let Some(rendered) = scalar(value) {
                    args.push(format!("{}={}", rule.flag, rendered));
                }
            }
            Emission::Count => {
                if let OptionValue::Enum(s) | OptionValue::Text(s) = value {
                    if !s.is_empty() {
                        args.push(format!("-{s}"));
                    }
                }
            }
        }
    }
}

fn scalar(value: &OptionValue) -> Option<String> {
    match value {
        OptionValue::Integer(i) => Some(i.to_string()),
        OptionValue::Number(n) => Some(n.to_string()),
        OptionValue::Text(s) | OptionValue::Enum(s) => Some(s.clone()),
        OptionValue::Bool(b) => Some(b.to_string()),
        OptionValue::List(items) => Some(items.join(" ")),
    }
}

fn check_conflicts(cfg: &ResolvedConfig) -> Result<()> {
    for (first, second) in CONFLICTS {
        if cfg.bool(first) && cfg.bool(second) {
            return Err(GearError::ConfigConflict {
                first: first.to_string(),
                second: second.to_string(),
            });
        }
    }
    Ok(())
}

/// Split the verbatim argument string, dropping resource-limit flags and
/// their detached values.
fn passthrough_args(raw: &str) -> Vec<String> {
    let mut kept = Vec::new();
    let mut tokens = raw.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if is_resource_flag(token) {
            warn!(flag = %token, "Dropping resource-limit flag from bids_app_args");
            if !token.contains('=') {
                if let Some(next) = tokens.peek() {
                    if !next.starts_with('-') {
                        tokens.next();
                    }
                }
            }
            continue;
        }
        kept.push(token.to_string());
    }

    kept
}
