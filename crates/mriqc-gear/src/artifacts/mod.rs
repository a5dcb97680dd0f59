//! Artifact packaging.
//!
//! - [`archive`]: deterministic tar.gz writer and secure extraction
//! - [`naming`]: archive file names
//! - [`collector`]: retention rules, primary/intermediate/report archives, cleanup

pub mod archive;
pub mod collector;
pub mod naming;

pub use archive::{extract_archive, ArchiveManifest, EntryKind, ManifestEntry};
pub use collector::{
    ArtifactCollector, CleanupFailure, CollectionReport, PackagingStatus, RetentionSpec,
};
pub use naming::{make_file_name_safe, ArchiveNaming};
