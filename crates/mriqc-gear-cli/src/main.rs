//! bids-mriqc gear entry point.
//!
//! ## Commands
//!
//! - `run`: validate the BIDS dataset, run MRIQC and package the results
//! - `show`: print the resolved configuration and the command that would run

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn, Level};

use mriqc_gear::command::DEFAULT_TOOL;
use mriqc_gear::environment::DEFAULT_ENVIRONMENT_FILE;
use mriqc_gear::outcome::EXIT_CONFIG_ERROR;
use mriqc_gear::validation::DEFAULT_VALIDATOR;
use mriqc_gear::{
    config_section, init_tracing, resolve, ArchiveNaming, ArtifactCollector, CancelHandle,
    CommandBuilder, ConfigSchema, EnvironmentOverlay, Executor, GearError, GearJob, GearOptions,
    GearPaths, GearPipeline, ResolvedConfig, RunLevel, ValidationGate,
};

#[derive(Parser)]
#[command(name = "mriqc-gear")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run MRIQC on a BIDS dataset as a gear", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines on stderr and the outcome as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, run MRIQC and package the results
    Run(RunArgs),

    /// Print the resolved configuration and the MRIQC command line
    Show(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Gear config file (flat options or a document with a "config" object)
    #[arg(long, env = "MRIQC_GEAR_CONFIG", default_value = "/flywheel/v0/config.json")]
    config: PathBuf,

    /// BIDS dataset to validate and process
    #[arg(long, env = "MRIQC_GEAR_BIDS_DIR", default_value = "/flywheel/v0/work/bids")]
    bids_dir: PathBuf,

    /// Directory receiving archives; raw output goes to <output-root>/<destination-id>
    #[arg(long, env = "MRIQC_GEAR_OUTPUT_ROOT", default_value = "/flywheel/v0/output")]
    output_root: PathBuf,

    /// Intermediate work directory
    #[arg(long, env = "MRIQC_GEAR_WORK_DIR", default_value = "/flywheel/v0/work")]
    work_dir: PathBuf,

    /// Analysis destination id (defaults to destination.id in the config file)
    #[arg(long, env = "MRIQC_GEAR_DESTINATION_ID")]
    destination_id: Option<String>,

    /// Label of the project, subject or session (defaults to the destination id)
    #[arg(long, env = "MRIQC_GEAR_RUN_LABEL")]
    run_label: Option<String>,

    /// Container level the gear was launched from: project, subject or session
    #[arg(long, env = "MRIQC_GEAR_RUN_LEVEL", default_value = "session")]
    run_level: RunLevel,

    /// Gear name used in archive names
    #[arg(long, env = "MRIQC_GEAR_NAME", default_value = "bids-mriqc")]
    gear_name: String,

    /// MRIQC executable
    #[arg(long, env = "MRIQC_GEAR_TOOL", default_value = DEFAULT_TOOL)]
    tool: String,

    /// BIDS validator executable
    #[arg(long, env = "MRIQC_GEAR_VALIDATOR", default_value = DEFAULT_VALIDATOR)]
    validator: String,

    /// Argument passed to the validator before the dataset path; repeatable.
    /// The default asks bids-validator for its JSON issue report.
    #[arg(
        long = "validator-arg",
        env = "MRIQC_GEAR_VALIDATOR_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        default_value = DEFAULT_VALIDATOR_ARGS
    )]
    validator_args: Vec<String>,

    /// .bidsignore-style file passed to the validator
    #[arg(long, env = "MRIQC_GEAR_IGNORE_FILE")]
    ignore_file: Option<PathBuf>,

    /// JSON file with the container environment
    #[arg(long, env = "MRIQC_GEAR_ENVIRONMENT_FILE", default_value = DEFAULT_ENVIRONMENT_FILE)]
    environment_file: PathBuf,

    /// Terminate MRIQC after this many seconds
    #[arg(long, env = "MRIQC_GEAR_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
}

/// Validator switches used when none are given.
const DEFAULT_VALIDATOR_ARGS: &str = "--json";

/// Config file contents after resolution.
struct LoadedConfig {
    document: Value,
    resolved: ResolvedConfig,
}

fn load_config(path: &Path) -> Result<LoadedConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let document: Value = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    let raw = config_section(&document)?;
    let resolved = resolve(&raw, &ConfigSchema::mriqc())?;
    Ok(LoadedConfig { document, resolved })
}

fn destination_id(args: &RunArgs, document: &Value) -> Result<String> {
    if let Some(id) = args.destination_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    document
        .pointer("/destination/id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            GearError::Config {
                option: "destination-id".to_string(),
                reason: "not given and no destination.id in the config file".to_string(),
            }
            .into()
        })
}

/// Everything needed to start a run.
struct Prepared {
    job: GearJob,
    collector: ArtifactCollector,
}

fn prepare(args: &RunArgs, config: &LoadedConfig) -> Result<Prepared> {
    let destination_id = destination_id(args, &config.document)?;
    let run_label = args
        .run_label
        .clone()
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| destination_id.clone());

    let environment = EnvironmentOverlay::load(&args.environment_file)?;
    let builder = CommandBuilder::new(&args.tool).with_environment(environment);

    let naming = ArchiveNaming::new(&args.gear_name, &run_label, &destination_id);
    let paths = GearPaths {
        bids_dir: args.bids_dir.clone(),
        output_dir: args.output_root.join(naming.destination_id()),
        work_dir: args.work_dir.clone(),
    };

    let job = GearJob::new(
        &config.resolved,
        paths,
        &builder,
        args.run_level,
        args.ignore_file.clone(),
    )?;
    let collector = ArtifactCollector::new(&args.output_root, naming);

    Ok(Prepared { job, collector })
}

fn validation_gate(args: &RunArgs, cancel: CancelHandle) -> ValidationGate {
    let extra_args = args
        .validator_args
        .iter()
        .filter(|a| !a.is_empty())
        .cloned()
        .collect();
    ValidationGate::new(&args.validator)
        .with_extra_args(extra_args)
        .with_cancel(cancel)
}

fn log_level(verbose: bool, options: &GearOptions) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        options.log_level
    }
}

async fn cmd_run(args: &RunArgs, verbose: bool, json: bool) -> Result<i32> {
    let config = load_config(&args.config)?;
    let options = GearOptions::from_resolved(&config.resolved);
    init_tracing(json, log_level(verbose, &options));

    let Prepared { job, collector } = prepare(args, &config)?;

    let executor = Executor::new().with_timeout(args.timeout_secs.map(Duration::from_secs));
    let cancel = executor.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the run");
            cancel.cancel();
        }
    });

    let mut gate = validation_gate(args, executor.cancel_handle());
    let outcome = GearPipeline::run(&job, &mut gate, &executor, &collector).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for message in &outcome.messages {
            println!("{message}");
        }
    }
    info!(exit_code = outcome.exit_code, "Gear finished");
    Ok(outcome.exit_code)
}

#[derive(Serialize)]
struct ShowOutput {
    config: serde_json::Map<String, Value>,
    command: Vec<String>,
    group_command: Option<Vec<String>>,
}

fn command_line(invocation: &mriqc_gear::ToolInvocation) -> Vec<String> {
    std::iter::once(invocation.program().to_string())
        .chain(invocation.args().iter().cloned())
        .collect()
}

fn cmd_show(args: &RunArgs, verbose: bool, json: bool) -> Result<i32> {
    let config = load_config(&args.config)?;
    let options = GearOptions::from_resolved(&config.resolved);
    init_tracing(json, log_level(verbose, &options));

    let Prepared { job, .. } = prepare(args, &config)?;
    let output = ShowOutput {
        config: config.resolved.to_raw(),
        command: command_line(&job.invocation),
        group_command: job.group_invocation.as_ref().map(command_line),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}

/// Exit code for an error that ended the run early.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<GearError>() {
        Some(e) => e.exit_code(),
        None => EXIT_CONFIG_ERROR,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args, cli.verbose, cli.json).await,
        Commands::Show(args) => cmd_show(args, cli.verbose, cli.json),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
