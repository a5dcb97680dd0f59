//! Archive file names.

use std::sync::LazyLock;

use regex::Regex;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-]+").expect("valid file name regex"));

/// Replace every run of characters outside `[A-Za-z0-9_.-]` with `_`.
///
/// Labels come from the platform hierarchy and may contain spaces, slashes
/// or anything else a human typed.
pub fn make_file_name_safe(input: &str) -> String {
    UNSAFE_CHARS.replace_all(input.trim(), "_").into_owned()
}

/// Naming scheme for the archives of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    gear_name: String,
    run_label: String,
    destination_id: String,
}

impl ArchiveNaming {
    pub fn new(
        gear_name: impl AsRef<str>,
        run_label: impl AsRef<str>,
        destination_id: impl AsRef<str>,
    ) -> Self {
        Self {
            gear_name: make_file_name_safe(gear_name.as_ref()),
            run_label: make_file_name_safe(run_label.as_ref()),
            destination_id: make_file_name_safe(destination_id.as_ref()),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// `<gear>_<label>_<dest>.tar.gz`
    pub fn primary(&self) -> String {
        format!(
            "{}_{}_{}.tar.gz",
            self.gear_name, self.run_label, self.destination_id
        )
    }

    /// `<gear>_work_<label>_<dest>.tar.gz`
    pub fn intermediate(&self) -> String {
        format!(
            "{}_work_{}_{}.tar.gz",
            self.gear_name, self.run_label, self.destination_id
        )
    }

    /// `<file name>.tar.gz` for a single report file.
    pub fn report(&self, file_name: &str) -> String {
        format!("{}.tar.gz", make_file_name_safe(file_name))
    }

    /// `<stem>_<dest>.tsv` for a group-level summary table.
    pub fn group_table(&self, stem: &str) -> String {
        format!("{}_{}.tsv", make_file_name_safe(stem), self.destination_id)
    }
}
