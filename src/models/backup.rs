use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative to the snapshot directory, `/` separated.
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Inventory of one snapshot. Written once, after every file is hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot: String,
    pub generated_at: DateTime<FixedOffset>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub snapshot: PathBuf,
    pub manifest: PathBuf,
    pub files_indexed: usize,
    /// Sources that could not be mirrored, with the reason.
    pub skipped_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub label: String,
    pub has_manifest: bool,
}
