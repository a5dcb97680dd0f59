//! Gear logging.
//!
//! Logs go to stderr so that stdout carries only the run outcome. Lines the
//! wrapped tool prints are re-emitted under the [`TOOL_OUTPUT_TARGET`] target
//! (stderr lines at `WARN`), which stays visible at `INFO` whatever `level`
//! the gear runs at. Lifecycle events carry an `event` field (`run.started`,
//! `stage.finished`, `run.finished`).

use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::outcome::RunOutcome;

/// Target of log lines relayed from the tool's stdout and stderr.
pub const TOOL_OUTPUT_TARGET: &str = "mriqc";

fn default_filter(level: Level) -> EnvFilter {
    let tool_level = if level < Level::INFO { Level::INFO } else { level };
    EnvFilter::new(format!("{},{TOOL_OUTPUT_TARGET}={}", level.as_str(), tool_level.as_str()))
}

/// Install the gear's subscriber. `RUST_LOG` replaces the default filter;
/// a second call is a no-op.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let layer = fmt::layer().with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

/// Span wrapping every log line of one run.
pub fn run_span(run_id: Uuid) -> tracing::Span {
    tracing::info_span!("gear.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: Uuid, program: &str, dry_run: bool) {
    info!(event = "run.started", run_id = %run_id, program = %program, dry_run);
}

pub fn emit_stage_finished(run_id: Uuid, stage: &str, passed: bool) {
    info!(event = "stage.finished", run_id = %run_id, stage = %stage, passed);
}

pub fn emit_run_finished(outcome: &RunOutcome, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %outcome.run_id,
        exit_code = outcome.exit_code,
        stage_failed = ?outcome.stage_failed,
        duration_ms,
    );
}
