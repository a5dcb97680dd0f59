//! Orchestration core for the bids-mriqc gear.
//!
//! Turns a gear configuration into a validated MRIQC invocation, gates it on
//! BIDS validation, runs it, and packs the results into deterministic
//! archives with an exit code that tells partial failures apart.
//!
//! - [`config`]: option schema and typed resolution
//! - [`command`]: flag table and invocation building
//! - [`environment`]: environment overlay for the child process
//! - [`validation`]: BIDS validation gate
//! - [`executor`]: subprocess execution, deadline, cancellation
//! - [`artifacts`]: archives, retention, cleanup
//! - [`metadata`]: IQM harvest into `.metadata.json`
//! - [`outcome`]: run outcome and exit codes
//! - [`pipeline`]: stage sequencing
//! - [`telemetry`]: tracing setup and lifecycle events

pub mod artifacts;
pub mod command;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod outcome;
pub mod pipeline;
pub mod telemetry;
pub mod validation;

pub use artifacts::{
    ArchiveManifest, ArchiveNaming, ArtifactCollector, CollectionReport, PackagingStatus,
    RetentionSpec,
};
pub use command::{AnalysisLevel, CommandBuilder, GearPaths, ToolInvocation};
pub use config::{config_section, resolve, ConfigSchema, GearOptions, ResolvedConfig};
pub use environment::EnvironmentOverlay;
pub use error::{GearError, Result};
pub use executor::{CancelHandle, ExecutionResult, Executor, Interruption, ToolRunner};
pub use outcome::{OutcomeReporter, RunOutcome, StageFailed};
pub use pipeline::{GearJob, GearPipeline, RunLevel};
pub use telemetry::init_tracing;
pub use validation::{ValidationGate, ValidationOutcome, ValidationState};
