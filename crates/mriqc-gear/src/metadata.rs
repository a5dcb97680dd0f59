//! Image quality metrics harvested into the platform's `.metadata.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::artifacts::archive::{resolve_entry, sorted_children, Resolved};
use crate::error::{GearError, Result};

/// Name of the metadata file picked up by the platform.
pub const METADATA_FILE: &str = ".metadata.json";

const SKIPPED_JSON: &[&str] = &["dataset_description.json", METADATA_FILE];

/// Collect the per-image IQM JSON files under `output_dir`.
///
/// Returns `{"analysis": {"info": {<file stem>: <iqms>}}}`, or `None` when no
/// IQM file was found. Files that are not valid JSON are skipped with a
/// warning.
pub fn harvest_iqms(output_dir: &Path) -> Result<Option<Value>> {
    let mut files = Vec::new();
    if output_dir.is_dir() {
        find_json(output_dir, &mut files)?;
    }

    let mut info = Map::new();
    for path in files {
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let data = fs::read_to_string(&path)?;
        match serde_json::from_str::<Value>(&data) {
            Ok(iqms) => {
                debug!(file = %path.display(), "Harvested IQMs");
                info.insert(stem, iqms);
            }
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable IQM file"),
        }
    }

    if info.is_empty() {
        info!(output_dir = %output_dir.display(), "No IQMs found to add to metadata");
        return Ok(None);
    }

    info!(count = info.len(), "Adding IQMs to metadata");
    Ok(Some(json!({ "analysis": { "info": info } })))
}

fn find_json(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for child in sorted_children(dir)? {
        let path = child.path();
        match resolve_entry(&child)? {
            Resolved::Directory => find_json(&path, found)?,
            Resolved::File => {
                let name = child.file_name();
                let name = name.to_string_lossy();
                let skipped = SKIPPED_JSON.iter().any(|s| *s == name);
                if name.ends_with(".json") && !skipped {
                    found.push(path);
                }
            }
            Resolved::Unsupported => {}
        }
    }
    Ok(())
}

/// Write `metadata` to `<dir>/.metadata.json`.
pub fn write_metadata(dir: &Path, metadata: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(METADATA_FILE);

    let tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file(), metadata)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path)
        .map_err(|e| GearError::packaging(&path, e.error))?;

    info!(path = %path.display(), "Wrote metadata");
    Ok(path)
}
