//! Output packaging: primary archive, optional intermediate archive, report
//! archives and cleanup of the raw output tree.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::archive::{
    is_excluded, plan_tree, resolve_entry, sorted_children, write_archive, ArchiveManifest,
    EntryKind, PlannedEntry, Resolved,
};
use super::naming::ArchiveNaming;
use crate::error::{GearError, Result};

/// What to keep from the intermediate work directory.
///
/// `retain_all` wins over the token sets. Tokens match file or directory
/// names exactly; there is no glob expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSpec {
    pub files: BTreeSet<String>,
    pub folders: BTreeSet<String>,
    pub retain_all: bool,
}

impl RetentionSpec {
    pub fn new(
        files: impl IntoIterator<Item = String>,
        folders: impl IntoIterator<Item = String>,
        retain_all: bool,
    ) -> Self {
        Self {
            files: files.into_iter().collect(),
            folders: folders.into_iter().collect(),
            retain_all,
        }
    }

    pub fn retain_all() -> Self {
        Self {
            retain_all: true,
            ..Self::default()
        }
    }

    /// True when nothing from the work directory is kept.
    pub fn is_empty(&self) -> bool {
        !self.retain_all && self.files.is_empty() && self.folders.is_empty()
    }
}

/// An output entry that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Everything packaging produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub primary: Option<ArchiveManifest>,
    pub intermediate: Option<ArchiveManifest>,
    pub intermediate_error: Option<String>,
    pub html_reports: Vec<ArchiveManifest>,
    pub report_errors: Vec<String>,
    pub group_tables: Vec<PathBuf>,
    /// Output entries the primary archive could not hold; left on disk.
    pub unarchived: Vec<PathBuf>,
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl CollectionReport {
    /// Non-fatal problems, in the order they happened.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        warnings.extend(
            self.report_errors
                .iter()
                .map(|e| format!("report archive failed: {e}")),
        );
        warnings.extend(
            self.unarchived
                .iter()
                .map(|p| format!("not archived, left in place: {}", p.display())),
        );
        if let Some(e) = &self.intermediate_error {
            warnings.push(format!("intermediate archive failed: {e}"));
        }
        warnings.extend(self.cleanup_failures.iter().map(|f| {
            format!("could not remove {}: {}", f.path.display(), f.error)
        }));
        warnings
    }
}

/// Result of the packaging stage.
#[derive(Debug)]
pub enum PackagingStatus {
    NotRun,
    Completed(CollectionReport),
    Failed(GearError),
}

impl PackagingStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, PackagingStatus::Failed(_))
    }

    pub fn report(&self) -> Option<&CollectionReport> {
        match self {
            PackagingStatus::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Packs the results of a run into `archive_dir`.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    archive_dir: PathBuf,
    naming: ArchiveNaming,
}

impl ArtifactCollector {
    pub fn new(archive_dir: impl Into<PathBuf>, naming: ArchiveNaming) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            naming,
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn naming(&self) -> &ArchiveNaming {
        &self.naming
    }

    pub fn primary_path(&self) -> PathBuf {
        self.archive_dir.join(self.naming.primary())
    }

    pub fn intermediate_path(&self) -> PathBuf {
        self.archive_dir.join(self.naming.intermediate())
    }

    /// Package `output_dir` and the retained part of `work_dir`.
    ///
    /// Only a failure of the primary archive is an error. Everything else is
    /// recorded in the returned report.
    pub fn collect(
        &self,
        work_dir: &Path,
        output_dir: &Path,
        retention: &RetentionSpec,
        keep_originals: bool,
    ) -> Result<CollectionReport> {
        fs::create_dir_all(output_dir).map_err(|e| GearError::packaging(output_dir, e))?;
        fs::create_dir_all(&self.archive_dir)
            .map_err(|e| GearError::packaging(&self.archive_dir, e))?;

        let mut report = CollectionReport::default();

        let primary_path = self.primary_path();
        let plan = plan_tree(output_dir, &dir_name(output_dir), &[])
            .map_err(|e| GearError::packaging(output_dir, e))?;
        let primary = write_archive(&primary_path, &plan.entries)?;
        info!(
            archive = %primary_path.display(),
            files = primary.file_count(),
            "Packed output directory"
        );
        report.primary = Some(primary);
        report.unarchived = plan.skipped;

        self.archive_reports(output_dir, &mut report);
        report.group_tables = self.copy_group_tables(output_dir);

        if !retention.is_empty() {
            match self.archive_intermediate(work_dir, output_dir, retention) {
                Ok(Some(manifest)) => {
                    info!(
                        archive = %manifest.archive_path.display(),
                        files = manifest.file_count(),
                        "Packed intermediate files"
                    );
                    report.intermediate = Some(manifest);
                }
                Ok(None) => {
                    warn!(work_dir = %work_dir.display(), "No intermediate files matched the retention rules");
                }
                Err(e) => {
                    warn!(error = %e, "Could not pack intermediate files");
                    report.intermediate_error = Some(e.to_string());
                }
            }
        }

        if keep_originals {
            info!(output_dir = %output_dir.display(), "Keeping raw output");
        } else {
            report.cleanup_failures =
                remove_tree_best_effort(output_dir, &report.unarchived, remove_entry);
        }

        Ok(report)
    }

    fn archive_reports(&self, output_dir: &Path, report: &mut CollectionReport) {
        let children = match sorted_children(output_dir) {
            Ok(children) => children,
            Err(e) => {
                report.report_errors.push(e.to_string());
                return;
            }
        };

        for child in children {
            let path = child.path();
            let is_html = path.extension().is_some_and(|ext| ext == "html");
            if !is_html || !path.is_file() {
                continue;
            }
            let file_name = child.file_name().to_string_lossy().into_owned();
            let archive_path = self.archive_dir.join(self.naming.report(&file_name));
            let planned = [PlannedEntry {
                source: path.clone(),
                name: PathBuf::from(&file_name),
                kind: EntryKind::File,
            }];
            match write_archive(&archive_path, &planned) {
                Ok(manifest) => report.html_reports.push(manifest),
                Err(e) => {
                    warn!(report = %path.display(), error = %e, "Could not pack report");
                    report.report_errors.push(e.to_string());
                }
            }
        }
    }

    /// Copy group-level `*.tsv` summaries next to the archives.
    fn copy_group_tables(&self, output_dir: &Path) -> Vec<PathBuf> {
        let Ok(children) = sorted_children(output_dir) else {
            return Vec::new();
        };

        let mut copied = Vec::new();
        for child in children {
            let path = child.path();
            if path.extension().is_none_or(|ext| ext != "tsv") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let dest = self.archive_dir.join(self.naming.group_table(&stem));
            match fs::copy(&path, &dest) {
                Ok(_) => copied.push(dest),
                Err(e) => warn!(table = %path.display(), error = %e, "Could not copy group table"),
            }
        }
        if !copied.is_empty() {
            info!(tables = ?copied, "Group-level tables");
        }
        copied
    }

    fn archive_intermediate(
        &self,
        work_dir: &Path,
        output_dir: &Path,
        retention: &RetentionSpec,
    ) -> Result<Option<ArchiveManifest>> {
        let exclude = [output_dir.to_path_buf(), self.archive_dir.clone()];
        let prefix = dir_name(work_dir);

        let mut planned = Vec::new();
        if retention.retain_all {
            planned = plan_tree(work_dir, &prefix, &exclude)
                .map_err(|e| GearError::packaging(work_dir, e))?
                .entries;
        } else {
            plan_selected(work_dir, &prefix, retention, &exclude, &mut planned)
                .map_err(|e| GearError::packaging(work_dir, e))?;
        }

        if !retention.retain_all && planned.is_empty() {
            return Ok(None);
        }

        write_archive(&self.intermediate_path(), &planned).map(Some)
    }
}

/// Walk `dir`, keeping files named in `retention.files` and whole subtrees
/// of directories named in `retention.folders`.
fn plan_selected(
    dir: &Path,
    prefix: &Path,
    retention: &RetentionSpec,
    exclude: &[PathBuf],
    planned: &mut Vec<PlannedEntry>,
) -> io::Result<()> {
    for child in sorted_children(dir)? {
        let path = child.path();
        if is_excluded(&path, exclude) {
            continue;
        }
        let file_name = child.file_name().to_string_lossy().into_owned();
        let name = prefix.join(&file_name);

        match resolve_entry(&child)? {
            Resolved::Directory if retention.folders.contains(&file_name) => {
                planned.extend(plan_tree(&path, &name, exclude)?.entries);
            }
            Resolved::Directory => plan_selected(&path, &name, retention, exclude, planned)?,
            Resolved::File if retention.files.contains(&file_name) => {
                planned.push(PlannedEntry {
                    source: path,
                    name,
                    kind: EntryKind::File,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn dir_name(dir: &Path) -> PathBuf {
    dir.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("output"))
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Remove everything under `dir` except the `keep` paths, then `dir` itself
/// once it is empty.
///
/// A failure on one entry does not stop the others.
fn remove_tree_best_effort(
    dir: &Path,
    keep: &[PathBuf],
    remove: fn(&Path) -> io::Result<()>,
) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();
    if remove_children(dir, keep, remove, &mut failures) {
        if let Err(e) = fs::remove_dir(dir) {
            failures.push(CleanupFailure {
                path: dir.to_path_buf(),
                error: e.to_string(),
            });
        }
    }
    failures
}

/// Returns true when `dir` was emptied.
fn remove_children(
    dir: &Path,
    keep: &[PathBuf],
    remove: fn(&Path) -> io::Result<()>,
    failures: &mut Vec<CleanupFailure>,
) -> bool {
    let children = match sorted_children(dir) {
        Ok(children) => children,
        Err(e) => {
            failures.push(CleanupFailure {
                path: dir.to_path_buf(),
                error: e.to_string(),
            });
            return false;
        }
    };

    let mut emptied = true;
    for child in children {
        let path = child.path();
        if keep.contains(&path) {
            emptied = false;
            continue;
        }
        if keep.iter().any(|k| k.starts_with(&path)) {
            remove_children(&path, keep, remove, failures);
            emptied = false;
            continue;
        }
        if let Err(e) = remove(&path) {
            warn!(path = %path.display(), error = %e, "Could not remove output entry");
            failures.push(CleanupFailure {
                path,
                error: e.to_string(),
            });
            emptied = false;
        }
    }
    emptied
}
