//! Terminal status of a run and its process exit code.
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | success |
//! | 2    | invalid or conflicting configuration, before any process ran |
//! | 20   | validation errors with the abort policy, or the validator could not run |
//! | 30   | tool failed without a usable exit code of its own |
//! | 40   | the primary archive could not be written |
//!
//! Any other tool exit code in `1..=255` is passed through unchanged.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::PackagingStatus;
use crate::executor::{ExecutionResult, Interruption};
use crate::validation::ValidationOutcome;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_VALIDATION_FAILED: i32 = 20;
pub const EXIT_EXECUTION_FAILED: i32 = 30;
pub const EXIT_PACKAGING_FAILED: i32 = 40;

const RESERVED_EXIT_CODES: &[i32] = &[
    EXIT_CONFIG_ERROR,
    EXIT_VALIDATION_FAILED,
    EXIT_EXECUTION_FAILED,
    EXIT_PACKAGING_FAILED,
];

/// First stage that failed, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailed {
    None,
    Validation,
    Execution,
    Packaging,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub exit_code: i32,
    pub stage_failed: StageFailed,
    pub validation: ValidationOutcome,
    pub messages: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.stage_failed == StageFailed::None
    }
}

/// Exit code to report for a failed tool run.
pub fn tool_exit_code(result: &ExecutionResult) -> i32 {
    let code = result.exit_code;
    if result.interruption.is_some()
        || !(1..=255).contains(&code)
        || RESERVED_EXIT_CODES.contains(&code)
    {
        EXIT_EXECUTION_FAILED
    } else {
        code
    }
}

fn describe_failure(label: &str, result: &ExecutionResult) -> String {
    match result.interruption {
        Some(Interruption::Cancelled) => format!("{label} was cancelled"),
        Some(Interruption::TimedOut) => format!("{label} timed out"),
        Some(Interruption::Signaled(sig)) => format!("{label} was terminated by signal {sig}"),
        None if result.exit_code == -1 => match result.log_lines.last() {
            Some(reason) => format!("{label} could not be run: {reason}"),
            None => format!("{label} could not be run"),
        },
        None => format!("{label} exited with code {}", result.exit_code),
    }
}

/// Folds stage results into a [`RunOutcome`].
#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    abort_on_validation_errors: bool,
    run_id: Uuid,
}

impl OutcomeReporter {
    pub fn new(abort_on_validation_errors: bool) -> Self {
        Self {
            abort_on_validation_errors,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn finalize(
        &self,
        validation: &ValidationOutcome,
        execution: Option<&ExecutionResult>,
        packaging: &PackagingStatus,
    ) -> RunOutcome {
        self.finalize_run(validation, execution, None, packaging)
    }

    /// Like [`finalize`](Self::finalize), with the result of a group-level
    /// run. A failed group run is reported but never fails the run.
    pub fn finalize_run(
        &self,
        validation: &ValidationOutcome,
        execution: Option<&ExecutionResult>,
        group: Option<&ExecutionResult>,
        packaging: &PackagingStatus,
    ) -> RunOutcome {
        let mut messages = Vec::new();
        let mut stage_failed = StageFailed::None;
        let mut exit_code = EXIT_SUCCESS;

        match validation {
            ValidationOutcome::Warnings(issues) => {
                messages.push(format!(
                    "BIDS validation reported {} warning(s)",
                    issues.len()
                ));
            }
            ValidationOutcome::Errors(issues) if self.abort_on_validation_errors => {
                messages.push(format!(
                    "BIDS validation found {} error(s); the tool was not run",
                    issues.len()
                ));
                stage_failed = StageFailed::Validation;
                exit_code = EXIT_VALIDATION_FAILED;
            }
            ValidationOutcome::Errors(issues) => {
                messages.push(format!(
                    "BIDS validation found {} error(s); continuing because aborting on BIDS errors is disabled",
                    issues.len()
                ));
            }
            ValidationOutcome::Clean | ValidationOutcome::Skipped => {}
        }

        if let Some(result) = execution {
            if result.dry_run {
                messages.push("gear-dry-run is set: the tool was not run".to_string());
            } else if !result.passed() {
                messages.push(describe_failure("tool", result));
                if stage_failed == StageFailed::None {
                    stage_failed = StageFailed::Execution;
                    exit_code = tool_exit_code(result);
                }
            }
        }

        if let Some(result) = group.filter(|r| !r.passed()) {
            messages.push(describe_failure("group-level run", result));
        }

        match packaging {
            PackagingStatus::Failed(e) => {
                messages.push(format!("packaging failed: {e}"));
                if stage_failed == StageFailed::None {
                    stage_failed = StageFailed::Packaging;
                    exit_code = EXIT_PACKAGING_FAILED;
                }
            }
            PackagingStatus::Completed(report) => messages.extend(report.warnings()),
            PackagingStatus::NotRun => {}
        }

        for message in &messages {
            warn!(run_id = %self.run_id, "{message}");
        }
        info!(
            run_id = %self.run_id,
            exit_code,
            stage_failed = ?stage_failed,
            "Run outcome"
        );

        RunOutcome {
            run_id: self.run_id,
            exit_code,
            stage_failed,
            validation: validation.clone(),
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{CleanupFailure, CollectionReport};
    use crate::error::GearError;
    use crate::validation::ValidationIssue;

    fn issue() -> ValidationIssue {
        ValidationIssue {
            code: Some("1".to_string()),
            key: None,
            reason: "missing dataset_description.json".to_string(),
        }
    }

    fn exited(code: i32) -> ExecutionResult {
        let mut r = ExecutionResult::dry_run();
        r.dry_run = false;
        r.exit_code = code;
        r
    }

    fn completed() -> PackagingStatus {
        PackagingStatus::Completed(CollectionReport::default())
    }

    #[test]
    fn test_all_clear() {
        let outcome = OutcomeReporter::new(true).finalize(
            &ValidationOutcome::Clean,
            Some(&exited(0)),
            &completed(),
        );
        assert_eq!(outcome.exit_code, EXIT_SUCCESS);
        assert!(outcome.succeeded());
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn test_validation_abort() {
        let outcome = OutcomeReporter::new(true).finalize(
            &ValidationOutcome::Errors(vec![issue()]),
            None,
            &completed(),
        );
        assert_eq!(outcome.stage_failed, StageFailed::Validation);
        assert_eq!(outcome.exit_code, EXIT_VALIDATION_FAILED);
    }

    #[test]
    fn test_validation_errors_downgraded() {
        let outcome = OutcomeReporter::new(false).finalize(
            &ValidationOutcome::Errors(vec![issue()]),
            Some(&exited(0)),
            &completed(),
        );
        assert_eq!(outcome.stage_failed, StageFailed::None);
        assert_eq!(outcome.exit_code, EXIT_SUCCESS);
        assert!(outcome.messages[0].contains("1 error(s)"));
    }

    #[test]
    fn test_tool_exit_code_passthrough() {
        let outcome =
            OutcomeReporter::new(true).finalize(&ValidationOutcome::Clean, Some(&exited(1)), &completed());
        assert_eq!(outcome.stage_failed, StageFailed::Execution);
        assert_eq!(outcome.exit_code, 1);
    }

    #[test]
    fn test_ambiguous_tool_exit_codes() {
        assert_eq!(tool_exit_code(&exited(-1)), EXIT_EXECUTION_FAILED);
        assert_eq!(tool_exit_code(&exited(20)), EXIT_EXECUTION_FAILED);
        assert_eq!(tool_exit_code(&exited(40)), EXIT_EXECUTION_FAILED);
        assert_eq!(tool_exit_code(&exited(137)), 137);

        let mut cancelled = exited(0);
        cancelled.interruption = Some(Interruption::Cancelled);
        assert_eq!(tool_exit_code(&cancelled), EXIT_EXECUTION_FAILED);
    }

    #[test]
    fn test_execution_failure_not_reclassified_by_packaging() {
        let failed = PackagingStatus::Failed(GearError::packaging("/out/a.tar.gz", "disk full"));
        let outcome =
            OutcomeReporter::new(true).finalize(&ValidationOutcome::Clean, Some(&exited(3)), &failed);
        assert_eq!(outcome.stage_failed, StageFailed::Execution);
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.messages.iter().any(|m| m.contains("disk full")));
    }

    #[test]
    fn test_packaging_failure() {
        let failed = PackagingStatus::Failed(GearError::packaging("/out/a.tar.gz", "disk full"));
        let outcome =
            OutcomeReporter::new(true).finalize(&ValidationOutcome::Clean, Some(&exited(0)), &failed);
        assert_eq!(outcome.stage_failed, StageFailed::Packaging);
        assert_eq!(outcome.exit_code, EXIT_PACKAGING_FAILED);
    }

    #[test]
    fn test_dry_run_and_cleanup_messages_ordered() {
        let report = CollectionReport {
            cleanup_failures: vec![CleanupFailure {
                path: "/out/dest/locked".into(),
                error: "permission denied".to_string(),
            }],
            ..CollectionReport::default()
        };
        let outcome = OutcomeReporter::new(true).finalize(
            &ValidationOutcome::Warnings(vec![issue()]),
            Some(&ExecutionResult::dry_run()),
            &PackagingStatus::Completed(report),
        );
        assert_eq!(outcome.exit_code, EXIT_SUCCESS);
        assert_eq!(outcome.messages.len(), 3);
        assert!(outcome.messages[0].contains("warning"));
        assert!(outcome.messages[1].contains("dry-run"));
        assert!(outcome.messages[2].contains("permission denied"));
    }

    #[test]
    fn test_group_failure_is_message_only() {
        let outcome = OutcomeReporter::new(true).finalize_run(
            &ValidationOutcome::Clean,
            Some(&exited(0)),
            Some(&exited(1)),
            &completed(),
        );
        assert!(outcome.succeeded());
        assert!(outcome.messages[0].contains("group-level run exited with code 1"));
    }
}
