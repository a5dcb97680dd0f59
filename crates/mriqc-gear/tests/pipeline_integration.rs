//! End-to-end pipeline runs against a temp gear layout, with a fake MRIQC
//! and shell scripts standing in for the validator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use mriqc_gear::artifacts::extract_archive;
use mriqc_gear::outcome::{EXIT_SUCCESS, EXIT_VALIDATION_FAILED};
use mriqc_gear::{
    resolve, ArchiveNaming, ArtifactCollector, CommandBuilder, ConfigSchema, ExecutionResult,
    Executor, GearError, GearJob, GearPaths, GearPipeline, RunLevel, StageFailed, ToolInvocation,
    ToolRunner, ValidationGate, ValidationOutcome,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Writes a small MRIQC-like output tree and records every call.
struct FakeMriqc {
    calls: Mutex<Vec<(Vec<String>, bool)>>,
    exit_code: i32,
}

impl FakeMriqc {
    fn new(exit_code: i32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            exit_code,
        }
    }

    fn calls(&self) -> Vec<(Vec<String>, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for FakeMriqc {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        dry_run: bool,
    ) -> mriqc_gear::Result<ExecutionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.args().to_vec(), dry_run));
        if dry_run {
            return Ok(ExecutionResult::dry_run());
        }

        let out = PathBuf::from(&invocation.args()[1]);
        if invocation.args()[2] == "group" {
            fs::write(out.join("group_T1w.tsv"), "bids_name\tcjv\nsub-01_T1w\t0.45\n")?;
        } else {
            fs::create_dir_all(out.join("sub-01/anat"))?;
            fs::write(
                out.join("sub-01/anat/sub-01_T1w.json"),
                r#"{"cjv": 0.45, "snr_total": 12.1}"#,
            )?;
            fs::write(out.join("sub-01_T1w.html"), "<html>report</html>")?;
        }

        let mut result = ExecutionResult::dry_run();
        result.dry_run = false;
        result.exit_code = self.exit_code;
        Ok(result)
    }
}

struct Site {
    root: TempDir,
}

impl Site {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let site = Self { root };
        fs::create_dir_all(site.bids().join("sub-01/anat")).unwrap();
        fs::write(
            site.bids().join("dataset_description.json"),
            r#"{"Name": "test", "BIDSVersion": "1.8.0"}"#,
        )
        .unwrap();
        fs::create_dir_all(site.work().join("workflow_enumerator/anatMRIQC")).unwrap();
        fs::write(site.work().join("workflow_enumerator/anatMRIQC/report.rst"), "rst").unwrap();
        fs::write(site.work().join("fd.txt"), "0.12").unwrap();
        site
    }

    fn bids(&self) -> PathBuf {
        self.root.path().join("work/bids")
    }

    fn work(&self) -> PathBuf {
        self.root.path().join("work")
    }

    fn archives(&self) -> PathBuf {
        self.root.path().join("output")
    }

    fn output(&self) -> PathBuf {
        self.archives().join("dest123")
    }

    fn paths(&self) -> GearPaths {
        GearPaths {
            bids_dir: self.bids(),
            output_dir: self.output(),
            work_dir: self.work(),
        }
    }

    fn job(&self, config: Value, run_level: RunLevel) -> GearJob {
        let raw = config.as_object().cloned().unwrap_or_default();
        let cfg = resolve(&raw, &ConfigSchema::mriqc()).unwrap();
        GearJob::new(&cfg, self.paths(), &CommandBuilder::default(), run_level, None).unwrap()
    }

    fn collector(&self) -> ArtifactCollector {
        ArtifactCollector::new(
            self.archives(),
            ArchiveNaming::new("bids-mriqc", "sub-01", "dest123"),
        )
    }

    /// A validator run as `sh <script> <bids_dir>`.
    fn validator(&self, body: &str) -> ValidationGate {
        let script = self.root.path().join("validator.sh");
        fs::write(&script, body).unwrap();
        ValidationGate::new("sh").with_extra_args(vec![script.to_string_lossy().into_owned()])
    }
}

const VALIDATOR_WITH_ERRORS: &str = r#"
echo '{"issues": {"errors": [{"key": "NIFTI_HEADER_UNREADABLE", "reason": "header unreadable"}], "warnings": []}}'
exit 1
"#;

const VALIDATOR_CLEAN: &str = "echo '{\"issues\": {\"errors\": [], \"warnings\": []}}'\n";

fn tar_names(archive: &Path, scratch: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, base: &Path, found: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, base, found);
            } else {
                found.push(path.strip_prefix(base).unwrap().to_path_buf());
            }
        }
    }
    extract_archive(archive, scratch).unwrap();
    let mut found = Vec::new();
    walk(scratch, scratch, &mut found);
    found.sort();
    found
}

#[tokio::test]
async fn test_validation_errors_abort_before_tool() {
    let site = Site::new();
    let job = site.job(json!({}), RunLevel::Subject);
    let mut gate = site.validator(VALIDATOR_WITH_ERRORS);
    let runner = FakeMriqc::new(0);

    let outcome = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap();

    assert!(runner.calls().is_empty(), "tool must not run");
    assert_eq!(outcome.stage_failed, StageFailed::Validation);
    assert_eq!(outcome.exit_code, EXIT_VALIDATION_FAILED);
    assert!(outcome.validation.is_errors());
    // packaging still runs
    assert!(site.collector().primary_path().exists());
}

#[tokio::test]
async fn test_validation_errors_downgraded_when_not_aborting() {
    let site = Site::new();
    let job = site.job(json!({"gear-abort-on-bids-error": false}), RunLevel::Subject);
    let mut gate = ValidationGate::new("sh").with_extra_args(vec!["-c".into(), "exit 1".into()]);
    let runner = FakeMriqc::new(0);

    let outcome = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap();

    assert!(matches!(outcome.validation, ValidationOutcome::Errors(_)));
    assert_eq!(runner.calls().len(), 1);
    assert_eq!(outcome.stage_failed, StageFailed::None);
    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert!(outcome.messages[0].contains("error(s)"));
}

#[tokio::test]
async fn test_missing_validator_is_fatal() {
    let site = Site::new();
    let job = site.job(json!({"gear-abort-on-bids-error": false}), RunLevel::Subject);
    let mut gate = ValidationGate::new("/nonexistent/bids-validator");
    let runner = FakeMriqc::new(0);

    let err = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap_err();

    assert!(matches!(err, GearError::ValidationTool { .. }));
    assert_eq!(err.exit_code(), EXIT_VALIDATION_FAILED);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_dry_run_launches_nothing_but_packages() {
    let site = Site::new();
    let job = site.job(
        json!({"gear-dry-run": true, "gear-run-bids-validation": false}),
        RunLevel::Subject,
    );
    let mut gate = ValidationGate::new("/nonexistent/bids-validator");
    let executor = Executor::new();

    let outcome = GearPipeline::run(&job, &mut gate, &executor, &site.collector())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert_eq!(outcome.validation, ValidationOutcome::Skipped);
    assert!(outcome.messages.iter().any(|m| m.contains("dry-run")));
    assert!(site.collector().primary_path().exists());
    assert!(!site.archives().join(".metadata.json").exists());
}

#[tokio::test]
async fn test_clean_run_packages_and_harvests() {
    let site = Site::new();
    let job = site.job(json!({}), RunLevel::Subject);
    let mut gate = site.validator(VALIDATOR_CLEAN);
    let runner = FakeMriqc::new(0);

    let outcome = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap();

    assert!(outcome.succeeded(), "messages: {:?}", outcome.messages);
    let (args, dry_run) = &runner.calls()[0];
    assert!(!dry_run);
    assert_eq!(args[2], "participant");
    assert!(args.contains(&"--fd_thres=0.2".to_string()));

    let metadata: Value =
        serde_json::from_str(&fs::read_to_string(site.archives().join(".metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["analysis"]["info"]["sub-01_T1w"]["cjv"], json!(0.45));

    assert!(site.archives().join("sub-01_T1w.html.tar.gz").exists());
    assert!(!site.output().exists(), "raw output is removed by default");
    assert!(!site.collector().intermediate_path().exists());
}

#[tokio::test]
async fn test_tool_exit_code_passthrough() {
    let site = Site::new();
    let job = site.job(json!({"gear-run-bids-validation": false}), RunLevel::Subject);
    let mut gate = ValidationGate::default();
    let runner = FakeMriqc::new(3);

    let outcome = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap();

    assert_eq!(outcome.stage_failed, StageFailed::Execution);
    assert_eq!(outcome.exit_code, 3);
    assert!(site.collector().primary_path().exists());
}

#[tokio::test]
async fn test_unlaunchable_tool_is_execution_failure() {
    let site = Site::new();
    let job = {
        let raw = json!({"gear-run-bids-validation": false});
        let cfg = resolve(raw.as_object().unwrap(), &ConfigSchema::mriqc()).unwrap();
        GearJob::new(
            &cfg,
            site.paths(),
            &CommandBuilder::new("/nonexistent/mriqc"),
            RunLevel::Subject,
            None,
        )
        .unwrap()
    };
    let mut gate = ValidationGate::default();

    let outcome = GearPipeline::run(&job, &mut gate, &Executor::new(), &site.collector())
        .await
        .unwrap();

    assert_eq!(outcome.stage_failed, StageFailed::Execution);
    assert_eq!(outcome.exit_code, mriqc_gear::outcome::EXIT_EXECUTION_FAILED);
    assert!(outcome.messages.iter().any(|m| m.contains("could not be run")));
}

#[tokio::test]
async fn test_cancel_during_validation_skips_launch() {
    let site = Site::new();
    let job = {
        let cfg = resolve(&Default::default(), &ConfigSchema::mriqc()).unwrap();
        GearJob::new(
            &cfg,
            site.paths(),
            &CommandBuilder::new("/nonexistent/mriqc"),
            RunLevel::Subject,
            None,
        )
        .unwrap()
    };
    let executor = Executor::new();
    let cancel = executor.cancel_handle();
    let mut gate = site.validator("sleep 30\n").with_cancel(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let outcome = GearPipeline::run(&job, &mut gate, &executor, &site.collector())
        .await
        .unwrap();

    assert_eq!(outcome.validation, ValidationOutcome::Skipped);
    assert_eq!(outcome.stage_failed, StageFailed::Execution);
    assert_eq!(outcome.exit_code, mriqc_gear::outcome::EXIT_EXECUTION_FAILED);
    assert!(outcome.messages.iter().any(|m| m.contains("cancelled")));
    assert!(!outcome.messages.iter().any(|m| m.contains("could not be run")));
    assert!(site.collector().primary_path().exists());
}

#[tokio::test]
async fn test_project_level_runs_group_analysis() {
    let site = Site::new();
    let job = site.job(
        json!({"gear-run-bids-validation": false, "gear-keep-output": true}),
        RunLevel::Project,
    );
    let mut gate = ValidationGate::default();
    let runner = FakeMriqc::new(0);

    let outcome = GearPipeline::run(&job, &mut gate, &runner, &site.collector())
        .await
        .unwrap();

    assert!(outcome.succeeded());
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0[2], "group");
    assert!(site.archives().join("group_T1w_dest123.tsv").exists());
    assert!(site.output().join("sub-01/anat/sub-01_T1w.json").exists());
}

#[tokio::test]
async fn test_retain_all_archives_every_work_file() {
    let site = Site::new();
    let job = site.job(
        json!({"gear-run-bids-validation": false, "gear-save-intermediate-output": true}),
        RunLevel::Subject,
    );
    let mut gate = ValidationGate::default();

    GearPipeline::run(&job, &mut gate, &FakeMriqc::new(0), &site.collector())
        .await
        .unwrap();

    let names = tar_names(
        &site.collector().intermediate_path(),
        &site.root.path().join("scratch"),
    );
    assert_eq!(
        names,
        vec![
            PathBuf::from("work/bids/dataset_description.json"),
            PathBuf::from("work/fd.txt"),
            PathBuf::from("work/workflow_enumerator/anatMRIQC/report.rst"),
        ]
    );
}

#[tokio::test]
async fn test_selected_retention() {
    let site = Site::new();
    let job = site.job(
        json!({
            "gear-run-bids-validation": false,
            "gear-intermediate-files": "fd.txt",
            "gear-intermediate-folders": ""
        }),
        RunLevel::Subject,
    );
    let mut gate = ValidationGate::default();

    GearPipeline::run(&job, &mut gate, &FakeMriqc::new(0), &site.collector())
        .await
        .unwrap();

    let names = tar_names(
        &site.collector().intermediate_path(),
        &site.root.path().join("scratch"),
    );
    assert_eq!(names, vec![PathBuf::from("work/fd.txt")]);
}

#[tokio::test]
async fn test_primary_archive_roundtrip_is_byte_identical() {
    let site = Site::new();
    let job = site.job(
        json!({"gear-run-bids-validation": false, "gear-keep-output": true}),
        RunLevel::Subject,
    );
    let mut gate = ValidationGate::default();

    GearPipeline::run(&job, &mut gate, &FakeMriqc::new(0), &site.collector())
        .await
        .unwrap();

    let scratch = site.root.path().join("scratch");
    let names = tar_names(&site.collector().primary_path(), &scratch);
    assert!(names.contains(&PathBuf::from("dest123/sub-01/anat/sub-01_T1w.json")));
    for name in names {
        let original = site.archives().join(&name);
        assert_eq!(
            fs::read(scratch.join(&name)).unwrap(),
            fs::read(&original).unwrap(),
            "{} differs after extraction",
            name.display()
        );
    }

    // repacking the same tree gives the same bytes
    let first = fs::read(site.collector().primary_path()).unwrap();
    let again = ArtifactCollector::new(
        site.root.path().join("again"),
        ArchiveNaming::new("bids-mriqc", "sub-01", "dest123"),
    );
    let report = again
        .collect(&site.work(), &site.output(), &Default::default(), true)
        .unwrap();
    let second = fs::read(report.primary.unwrap().archive_path).unwrap();
    assert_eq!(first, second);
}
