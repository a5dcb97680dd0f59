//! Run orchestration: validation, execution, metadata, packaging, report.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::artifacts::{ArtifactCollector, PackagingStatus};
use crate::command::{AnalysisLevel, CommandBuilder, GearPaths, ToolInvocation};
use crate::config::{GearOptions, ResolvedConfig};
use crate::error::{GearError, Result};
use crate::executor::{ExecutionResult, ToolRunner};
use crate::metadata::{harvest_iqms, write_metadata};
use crate::outcome::{OutcomeReporter, RunOutcome};
use crate::telemetry::{emit_run_finished, emit_run_started, emit_stage_finished, run_span};
use crate::validation::{GateDecision, ValidationGate, ValidationOutcome};

/// Level of the container the run was launched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLevel {
    Project,
    Subject,
    Session,
}

impl RunLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLevel::Project => "project",
            RunLevel::Subject => "subject",
            RunLevel::Session => "session",
        }
    }
}

impl fmt::Display for RunLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "project" => Ok(RunLevel::Project),
            "subject" => Ok(RunLevel::Subject),
            "session" => Ok(RunLevel::Session),
            other => Err(format!(
                "unknown run level '{other}' (expected project, subject or session)"
            )),
        }
    }
}

/// Everything a run needs, built before any process is started.
#[derive(Debug, Clone)]
pub struct GearJob {
    pub options: GearOptions,
    pub paths: GearPaths,
    pub invocation: ToolInvocation,
    /// Group-level invocation, present for project-level runs.
    pub group_invocation: Option<ToolInvocation>,
    pub ignore_file: Option<PathBuf>,
    pub run_level: RunLevel,
}

impl GearJob {
    /// Build the job from a resolved config.
    ///
    /// Fails with a config error before anything runs.
    pub fn new(
        cfg: &ResolvedConfig,
        paths: GearPaths,
        builder: &CommandBuilder,
        run_level: RunLevel,
        ignore_file: Option<PathBuf>,
    ) -> Result<Self> {
        let invocation = builder.build(cfg, &paths)?;
        let group_invocation = match run_level {
            RunLevel::Project => Some(builder.build_for_level(cfg, &paths, AnalysisLevel::Group)?),
            RunLevel::Subject | RunLevel::Session => None,
        };

        Ok(Self {
            options: GearOptions::from_resolved(cfg),
            paths,
            invocation,
            group_invocation,
            ignore_file,
            run_level,
        })
    }
}

/// Sequential pipeline over the gear stages.
pub struct GearPipeline;

impl GearPipeline {
    /// Run a job to completion.
    ///
    /// Only a validator that cannot be launched is returned as an error;
    /// every other failure is reported in the [`RunOutcome`].
    pub async fn run(
        job: &GearJob,
        gate: &mut ValidationGate,
        runner: &dyn ToolRunner,
        collector: &ArtifactCollector,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        Self::run_stages(run_id, job, gate, runner, collector)
            .instrument(run_span(run_id))
            .await
    }

    async fn run_stages(
        run_id: Uuid,
        job: &GearJob,
        gate: &mut ValidationGate,
        runner: &dyn ToolRunner,
        collector: &ArtifactCollector,
    ) -> Result<RunOutcome> {
        let start = Instant::now();
        let opts = &job.options;
        emit_run_started(run_id, job.invocation.program(), opts.dry_run);

        let validation = if opts.run_validation {
            gate.validate(&job.paths.bids_dir, job.ignore_file.as_deref())
                .await?
        } else {
            info!("BIDS validation disabled");
            ValidationOutcome::Skipped
        };
        let decision = GateDecision::for_outcome(&validation, opts.abort_on_bids_error);
        emit_stage_finished(run_id, "validation", !validation.is_errors());

        let execution = match &decision {
            GateDecision::Abort(reason) => {
                warn!(reason = %reason, "Command was NOT run");
                None
            }
            GateDecision::ProceedWithWarning(reason) => {
                warn!(reason = %reason, "Continuing despite validation issues");
                Some(Self::execute(runner, &job.invocation, job, opts.dry_run).await)
            }
            GateDecision::Proceed => {
                Some(Self::execute(runner, &job.invocation, job, opts.dry_run).await)
            }
        };
        if let Some(result) = &execution {
            emit_stage_finished(run_id, "execution", result.passed());
        }

        let participant_passed = execution.as_ref().is_some_and(|r| r.passed() && !r.dry_run);

        let group = match (&job.group_invocation, participant_passed) {
            (Some(invocation), true) => {
                info!("Running group-level analysis");
                let result = Self::execute(runner, invocation, job, false).await;
                emit_stage_finished(run_id, "group", result.passed());
                Some(result)
            }
            _ => None,
        };

        if execution.as_ref().is_some_and(|r| !r.dry_run) {
            Self::store_metadata(job, collector);
        }

        let packaging = Self::package(job, collector).await;
        emit_stage_finished(run_id, "packaging", !packaging.is_failed());

        let outcome = OutcomeReporter::new(opts.abort_on_bids_error)
            .with_run_id(run_id)
            .finalize_run(&validation, execution.as_ref(), group.as_ref(), &packaging);
        emit_run_finished(&outcome, start.elapsed().as_millis() as u64);
        Ok(outcome)
    }

    /// Run one invocation, folding launch errors into a failed result. Nothing
    /// is started once cancellation has been requested.
    async fn execute(
        runner: &dyn ToolRunner,
        invocation: &ToolInvocation,
        job: &GearJob,
        dry_run: bool,
    ) -> ExecutionResult {
        if runner.is_cancelled() {
            warn!(command = %invocation, "Cancellation pending, command was NOT run");
            return ExecutionResult::cancelled_before_start();
        }
        if !dry_run {
            if let Err(e) = std::fs::create_dir_all(&job.paths.output_dir) {
                warn!(output_dir = %job.paths.output_dir.display(), error = %e, "Could not create output directory");
                return ExecutionResult::launch_failure(format!(
                    "could not create {}: {e}",
                    job.paths.output_dir.display()
                ));
            }
        }

        match runner.run(invocation, dry_run).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Tool execution error");
                ExecutionResult::launch_failure(e.to_string())
            }
        }
    }

    fn store_metadata(job: &GearJob, collector: &ArtifactCollector) {
        let harvested = harvest_iqms(&job.paths.output_dir).and_then(|metadata| match metadata {
            Some(metadata) => write_metadata(collector.archive_dir(), &metadata).map(Some),
            None => Ok(None),
        });
        if let Err(e) = harvested {
            warn!(error = %e, "Could not store IQM metadata");
        }
    }

    async fn package(job: &GearJob, collector: &ArtifactCollector) -> PackagingStatus {
        let collector = collector.clone();
        let work_dir = job.paths.work_dir.clone();
        let output_dir = job.paths.output_dir.clone();
        let retention = job.options.retention.clone();
        let keep_output = job.options.keep_output;

        let joined = tokio::task::spawn_blocking(move || {
            collector.collect(&work_dir, &output_dir, &retention, keep_output)
        })
        .await;

        match joined {
            Ok(Ok(report)) => PackagingStatus::Completed(report),
            Ok(Err(e)) => {
                warn!(error = %e, "Packaging failed");
                PackagingStatus::Failed(e)
            }
            Err(e) => PackagingStatus::Failed(GearError::packaging(&job.paths.output_dir, e)),
        }
    }
}
