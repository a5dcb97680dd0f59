//! BIDS validation gate.
//!
//! Runs the external validator before the tool and classifies its result.
//! Issues reported by the validator are data, not faults: only a validator
//! that cannot be launched at all is an error.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{GearError, Result};
use crate::executor::CancelHandle;

/// Default validator executable.
pub const DEFAULT_VALIDATOR: &str = "bids-validator";

/// A single issue reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: Option<String>,
    pub key: Option<String>,
    pub reason: String,
}

impl ValidationIssue {
    fn from_json(value: &Value) -> Self {
        let field = |name: &str| {
            value.get(name).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        let code = field("code");
        let key = field("key");
        let reason = field("reason")
            .or_else(|| field("message"))
            .or_else(|| key.clone())
            .unwrap_or_else(|| "unspecified issue".to_string());
        Self { code, key, reason }
    }

    fn synthetic(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            key: None,
            reason: reason.into(),
        }
    }
}

/// Classified result of a validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "issues", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Clean,
    Warnings(Vec<ValidationIssue>),
    Errors(Vec<ValidationIssue>),
    Skipped,
}

impl ValidationOutcome {
    pub fn is_errors(&self) -> bool {
        matches!(self, ValidationOutcome::Errors(_))
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            ValidationOutcome::Warnings(issues) | ValidationOutcome::Errors(issues) => issues,
            _ => &[],
        }
    }
}

/// Lifecycle of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    NotRun,
    Running,
    Clean,
    Warnings,
    Errors,
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ValidationState::Clean | ValidationState::Warnings | ValidationState::Errors
        )
    }
}

/// What the pipeline does with a validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    ProceedWithWarning(String),
    Abort(String),
}

impl GateDecision {
    /// Apply the abort policy to an outcome.
    pub fn for_outcome(outcome: &ValidationOutcome, abort_on_error: bool) -> Self {
        match outcome {
            ValidationOutcome::Errors(issues) => {
                let msg = format!("BIDS validation found {} error(s)", issues.len());
                if abort_on_error {
                    GateDecision::Abort(msg)
                } else {
                    GateDecision::ProceedWithWarning(msg)
                }
            }
            ValidationOutcome::Warnings(issues) => GateDecision::ProceedWithWarning(format!(
                "BIDS validation reported {} warning(s)",
                issues.len()
            )),
            ValidationOutcome::Clean | ValidationOutcome::Skipped => GateDecision::Proceed,
        }
    }

    pub fn allows_execution(&self) -> bool {
        !matches!(self, GateDecision::Abort(_))
    }
}

/// Runs the validator and tracks the gate state.
#[derive(Debug)]
pub struct ValidationGate {
    program: String,
    extra_args: Vec<String>,
    state: ValidationState,
    cancel: Option<CancelHandle>,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATOR)
    }
}

impl ValidationGate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            state: ValidationState::NotRun,
            cancel: None,
        }
    }

    /// Arguments placed before the dataset path, e.g. a JSON output switch.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Abandon a running validation when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command line for a validation run.
    pub fn command_args(&self, bids_dir: &Path, ignore_file: Option<&Path>) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push(bids_dir.to_string_lossy().into_owned());
        if let Some(ignore) = ignore_file {
            args.push("--ignore".to_string());
            args.push(ignore.to_string_lossy().into_owned());
        }
        args
    }

    /// Run the validator against `bids_dir`.
    pub async fn validate(
        &mut self,
        bids_dir: &Path,
        ignore_file: Option<&Path>,
    ) -> Result<ValidationOutcome> {
        self.state = ValidationState::Running;
        let args = self.command_args(bids_dir, ignore_file);
        info!(validator = %self.program, bids_dir = %bids_dir.display(), "Running BIDS validation");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match &self.cancel {
            Some(cancel) => tokio::select! {
                output = cmd.output() => output,
                _ = cancel.cancelled() => {
                    warn!(validator = %self.program, "Cancellation requested, validation abandoned");
                    self.state = ValidationState::NotRun;
                    return Ok(ValidationOutcome::Skipped);
                }
            },
            None => cmd.output().await,
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                self.state = ValidationState::NotRun;
                return Err(GearError::ValidationTool {
                    program: self.program.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = classify(output.status.code(), &stdout, &stderr);

        self.state = match &outcome {
            ValidationOutcome::Errors(_) => ValidationState::Errors,
            ValidationOutcome::Warnings(_) => ValidationState::Warnings,
            _ => ValidationState::Clean,
        };

        match &outcome {
            ValidationOutcome::Errors(issues) => {
                for issue in issues {
                    warn!(code = ?issue.code, "BIDS error: {}", issue.reason);
                }
            }
            ValidationOutcome::Warnings(issues) => {
                for issue in issues {
                    info!(code = ?issue.code, "BIDS warning: {}", issue.reason);
                }
            }
            _ => info!("BIDS validation passed"),
        }

        Ok(outcome)
    }
}

/// Parsed `{"issues": {"errors": [...], "warnings": [...]}}` report.
struct ReportedIssues {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

fn parse_report(stdout: &str) -> Option<ReportedIssues> {
    let value: Value = serde_json::from_str(stdout.trim()).ok()?;
    let issues = value.get("issues")?;
    let list = |name: &str| {
        issues
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(ValidationIssue::from_json)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    Some(ReportedIssues {
        errors: list("errors"),
        warnings: list("warnings"),
    })
}

/// Classify a finished validator run from its exit code and output.
pub fn classify(exit_code: Option<i32>, stdout: &str, stderr: &str) -> ValidationOutcome {
    let report = parse_report(stdout);
    let (mut errors, warnings) = match report {
        Some(r) => (r.errors, r.warnings),
        None => (Vec::new(), Vec::new()),
    };

    let failed = exit_code != Some(0);
    if failed && errors.is_empty() {
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(str::trim)
            .unwrap_or("no diagnostic output");
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        errors.push(ValidationIssue::synthetic(format!(
            "validator exited with {code}: {detail}"
        )));
    }

    if !errors.is_empty() {
        ValidationOutcome::Errors(errors)
    } else if !warnings.is_empty() {
        ValidationOutcome::Warnings(warnings)
    } else {
        ValidationOutcome::Clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_clean() {
        assert_eq!(classify(Some(0), "", ""), ValidationOutcome::Clean);
    }

    #[test]
    fn test_classify_nonzero_without_report() {
        let outcome = classify(Some(1), "not json", "Error: dataset_description.json missing\n");
        match outcome {
            ValidationOutcome::Errors(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].reason.contains("dataset_description.json"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_warnings_with_zero_exit() {
        let stdout = r#"{"issues": {"errors": [], "warnings": [{"code": 38, "key": "INCONSISTENT_SUBJECTS", "reason": "Not all subjects contain the same files"}]}}"#;
        let outcome = classify(Some(0), stdout, "");
        match outcome {
            ValidationOutcome::Warnings(issues) => {
                assert_eq!(issues[0].code.as_deref(), Some("38"));
                assert_eq!(issues[0].key.as_deref(), Some("INCONSISTENT_SUBJECTS"));
            }
            other => panic!("expected warnings, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_blocking_issues_with_zero_exit() {
        let stdout = r#"{"issues": {"errors": [{"key": "NIFTI_HEADER_UNREADABLE"}], "warnings": []}}"#;
        let outcome = classify(Some(0), stdout, "");
        assert!(outcome.is_errors());
        assert_eq!(outcome.issues()[0].reason, "NIFTI_HEADER_UNREADABLE");
    }

    #[test]
    fn test_classify_signal_is_error() {
        assert!(classify(None, "", "").is_errors());
    }

    #[test]
    fn test_gate_decision_policy() {
        let errors = ValidationOutcome::Errors(vec![ValidationIssue::synthetic("bad")]);
        assert!(!GateDecision::for_outcome(&errors, true).allows_execution());
        assert!(matches!(
            GateDecision::for_outcome(&errors, false),
            GateDecision::ProceedWithWarning(_)
        ));
        assert_eq!(
            GateDecision::for_outcome(&ValidationOutcome::Skipped, true),
            GateDecision::Proceed
        );
    }

    #[test]
    fn test_command_args_with_ignore() {
        let gate = ValidationGate::new("bids-validator").with_extra_args(vec!["--json".into()]);
        let args = gate.command_args(Path::new("/work/bids"), Some(Path::new("/in/.bidsignore")));
        assert_eq!(args, vec!["--json", "/work/bids", "--ignore", "/in/.bidsignore"]);
    }

    #[tokio::test]
    async fn test_missing_validator_is_tool_error() {
        let mut gate = ValidationGate::new("/nonexistent-validator-binary");
        let err = gate.validate(Path::new("."), None).await.unwrap_err();
        assert!(matches!(err, GearError::ValidationTool { .. }));
        assert_eq!(gate.state(), ValidationState::NotRun);
    }

    #[tokio::test]
    async fn test_failing_validator_reaches_errors_state() {
        let mut gate = ValidationGate::new("false");
        let outcome = gate.validate(Path::new("."), None).await.unwrap();
        assert!(outcome.is_errors());
        assert_eq!(gate.state(), ValidationState::Errors);
        assert!(gate.state().is_terminal());
    }

    #[tokio::test]
    async fn test_passing_validator_reaches_clean_state() {
        let mut gate = ValidationGate::new("true");
        let outcome = gate.validate(Path::new("."), None).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Clean);
        assert_eq!(gate.state(), ValidationState::Clean);
    }

    #[tokio::test]
    async fn test_cancel_abandons_validation() {
        let cancel = CancelHandle::new();
        let mut gate = ValidationGate::new("sh")
            .with_extra_args(vec!["-c".to_string(), "sleep 30".to_string()])
            .with_cancel(cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = gate.validate(Path::new("."), None).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Skipped);
        assert_eq!(gate.state(), ValidationState::NotRun);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
