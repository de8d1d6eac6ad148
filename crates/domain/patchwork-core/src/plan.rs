use crate::diff::{needing_fetch, DiffResult};
use crate::report::RunReport;
use crate::{Manifest, ManifestEntry, ARCHIVE_EXTENSION};
use serde::{Deserialize, Serialize};

/// One file the scheduler must fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub entry: ManifestEntry,
    /// Download-directory-relative destination.
    pub destination: String,
    /// Transfer attempts made so far, across every mirror.
    pub attempt: u32,
}

impl DownloadTask {
    pub fn new(entry: ManifestEntry) -> Self {
        Self {
            destination: entry.path.clone(),
            entry,
            attempt: 0,
        }
    }

    /// Tasks for every entry the diff marked as needing an update, in manifest order.
    pub fn from_diff(manifest: &Manifest, results: &[DiffResult]) -> Vec<Self> {
        needing_fetch(manifest, results)
            .cloned()
            .map(Self::new)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveFile {
    /// Download-directory-relative path of the staged file.
    pub source: String,
    /// Name inside the archive (backslash separated).
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveBuildPlan {
    pub archive: String,
    pub files: Vec<ArchiveFile>,
    pub force_rebuild: bool,
}

impl ArchiveBuildPlan {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.archive, ARCHIVE_EXTENSION)
    }
}

fn archive_file(entry: &ManifestEntry) -> ArchiveFile {
    ArchiveFile {
        source: entry.path.clone(),
        member: entry.member_name(),
    }
}

/// Decide which archives need rebuilding after a run.
///
/// An archive is planned when one of its members was staged successfully this
/// run, or unconditionally when `force` is set. Forced plans carry every member
/// that `is_staged` reports present, so the archive is rebuilt from the full
/// staged set. Plans are ordered by archive name.
pub fn plan_archive_builds<F>(
    manifest: &Manifest,
    report: &RunReport,
    force: bool,
    is_staged: F,
) -> Vec<ArchiveBuildPlan>
where
    F: Fn(&ManifestEntry) -> bool,
{
    let mut plans = Vec::new();

    for archive in manifest.archives() {
        let mut files: Vec<ArchiveFile> = manifest
            .members(archive)
            .filter(|e| report.is_succeeded(&e.path) || (force && is_staged(e)))
            .map(archive_file)
            .collect();

        if files.is_empty() && !force {
            continue;
        }
        files.sort();

        plans.push(ArchiveBuildPlan {
            archive: archive.to_string(),
            files,
            force_rebuild: force,
        });
    }

    plans
}
