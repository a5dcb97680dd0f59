//! Deterministic tar.gz archives.
//!
//! Entries are written in sorted path order with `HeaderMode::Deterministic`
//! and a timestamp-free gzip header, so identical trees produce identical
//! archives. Archives are written to a temp file next to the destination and
//! only persisted once complete; a fault part way through leaves nothing
//! behind.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, HeaderMode};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{GearError, Result};

/// Kind of a planned archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    File,
}

/// An entry to be written: where it comes from and what it is called inside
/// the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub source: PathBuf,
    pub name: PathBuf,
    pub kind: EntryKind,
}

/// One entry actually written into an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source: PathBuf,
    pub archive_path: PathBuf,
    pub kind: EntryKind,
    /// SHA-256 of file content; `None` for directories.
    pub sha256: Option<String>,
}

/// Ordered record of what went into an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub archive_path: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

impl ArchiveManifest {
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }

    /// Archive-relative paths of all file entries.
    pub fn file_names(&self) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.archive_path.as_path())
            .collect()
    }
}

/// Sorted children of a directory.
pub(crate) fn sorted_children(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut children = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|e| e.file_name());
    Ok(children)
}

/// Entries planned for a tree, plus the paths that could not be planned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreePlan {
    pub entries: Vec<PlannedEntry>,
    /// Dangling or directory symlinks and special files. They are not in the
    /// archive and must not be removed as if they were.
    pub skipped: Vec<PathBuf>,
}

/// How a directory entry is archived.
pub(crate) enum Resolved {
    Directory,
    File,
    Unsupported,
}

/// Resolve a directory entry. Symlinks to regular files are archived as the
/// file they point to; symlinks to directories are not followed.
pub(crate) fn resolve_entry(child: &fs::DirEntry) -> io::Result<Resolved> {
    let file_type = child.file_type()?;
    if file_type.is_dir() {
        return Ok(Resolved::Directory);
    }
    if file_type.is_file() {
        return Ok(Resolved::File);
    }
    if file_type.is_symlink() && fs::metadata(child.path()).is_ok_and(|m| m.is_file()) {
        return Ok(Resolved::File);
    }
    Ok(Resolved::Unsupported)
}

/// Plan a whole tree rooted at `root`, named `prefix` inside the archive.
///
/// Paths listed in `exclude` (and everything beneath them) are left out.
pub fn plan_tree(root: &Path, prefix: &Path, exclude: &[PathBuf]) -> io::Result<TreePlan> {
    let mut plan = TreePlan {
        entries: vec![PlannedEntry {
            source: root.to_path_buf(),
            name: prefix.to_path_buf(),
            kind: EntryKind::Directory,
        }],
        skipped: Vec::new(),
    };
    plan_children(root, prefix, exclude, &mut plan)?;
    Ok(plan)
}

fn plan_children(
    dir: &Path,
    prefix: &Path,
    exclude: &[PathBuf],
    plan: &mut TreePlan,
) -> io::Result<()> {
    for child in sorted_children(dir)? {
        let path = child.path();
        if is_excluded(&path, exclude) {
            continue;
        }
        let name = prefix.join(child.file_name());
        match resolve_entry(&child)? {
            Resolved::Directory => {
                plan.entries.push(PlannedEntry {
                    source: path.clone(),
                    name: name.clone(),
                    kind: EntryKind::Directory,
                });
                plan_children(&path, &name, exclude, plan)?;
            }
            Resolved::File => plan.entries.push(PlannedEntry {
                source: path,
                name,
                kind: EntryKind::File,
            }),
            Resolved::Unsupported => {
                warn!(path = %path.display(), "Not archiving unsupported entry");
                plan.skipped.push(path);
            }
        }
    }
    Ok(())
}

pub(crate) fn is_excluded(path: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|x| path.starts_with(x))
}

/// Write `entries` into a gzip-compressed tarball at `archive_path`.
pub fn write_archive(archive_path: &Path, entries: &[PlannedEntry]) -> Result<ArchiveManifest> {
    let dest_dir = archive_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dest_dir).map_err(|e| GearError::packaging(archive_path, e))?;

    let tmp = NamedTempFile::new_in(dest_dir).map_err(|e| GearError::packaging(archive_path, e))?;
    let gz = GzBuilder::new().mtime(0).write(tmp, Compression::default());
    let mut tar = Builder::new(gz);
    tar.mode(HeaderMode::Deterministic);
    tar.follow_symlinks(false);

    let mut manifest = Vec::with_capacity(entries.len());
    for entry in entries {
        let sha256 = match entry.kind {
            EntryKind::Directory => {
                tar.append_dir(&entry.name, &entry.source)
                    .map_err(|e| GearError::packaging(&entry.source, e))?;
                None
            }
            EntryKind::File => {
                let mut file =
                    File::open(&entry.source).map_err(|e| GearError::packaging(&entry.source, e))?;
                tar.append_file(&entry.name, &mut file)
                    .map_err(|e| GearError::packaging(&entry.source, e))?;
                Some(file_sha256(&entry.source).map_err(|e| GearError::packaging(&entry.source, e))?)
            }
        };
        manifest.push(ManifestEntry {
            source: entry.source.clone(),
            archive_path: entry.name.clone(),
            kind: entry.kind,
            sha256,
        });
    }

    let gz = tar
        .into_inner()
        .map_err(|e| GearError::packaging(archive_path, e))?;
    let tmp = gz.finish().map_err(|e| GearError::packaging(archive_path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| GearError::packaging(archive_path, e))?;
    tmp.persist(archive_path)
        .map_err(|e| GearError::packaging(archive_path, e.error))?;

    debug!(archive = %archive_path.display(), entries = manifest.len(), "Archive written");
    Ok(ArchiveManifest {
        archive_path: archive_path.to_path_buf(),
        entries: manifest,
    })
}

fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Extract an archive, rejecting symlinks, absolute paths and `..`.
pub fn extract_archive(archive_path: &Path, extract_to: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| GearError::packaging(archive_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    fs::create_dir_all(extract_to)?;

    for entry in archive
        .entries()
        .map_err(|e| GearError::packaging(archive_path, e))?
    {
        let mut entry = entry.map_err(|e| GearError::packaging(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| GearError::packaging(archive_path, e))?
            .into_owned();

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(GearError::packaging(
                archive_path,
                format!("archive contains link: {}", path.display()),
            ));
        }
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(GearError::packaging(
                archive_path,
                format!("archive entry escapes destination: {}", path.display()),
            ));
        }

        entry
            .unpack_in(extract_to)
            .map_err(|e| GearError::packaging(archive_path, e))?;
    }

    Ok(())
}
