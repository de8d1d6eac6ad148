use crate::path_utils::PatchPath;
use crate::{LocalFileState, Manifest, ManifestEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Unchanged,
    Missing,
    Modified,
    /// Present locally but not named by the manifest.
    ExtraneousLocal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub path: String,
    pub status: FileStatus,
}

impl DiffResult {
    pub fn needs_fetch(&self) -> bool {
        matches!(self.status, FileStatus::Missing | FileStatus::Modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Fetch only entries whose local copy is absent or differs.
    #[default]
    Outdated,
    /// Fetch every entry regardless of local state.
    All {
        /// Also fetch loose `.mpq` containers, which are large and usually unchanged.
        include_containers: bool,
    },
}

impl DiffMode {
    /// Whether this mode passes over `entry` without fetching it or looking at
    /// its local state.
    pub fn skips(&self, entry: &ManifestEntry) -> bool {
        matches!(
            self,
            DiffMode::All {
                include_containers: false
            }
        ) && entry.is_container()
    }
}

/// Supplies the local fingerprint for a manifest entry on demand.
pub trait LocalStateSource {
    fn state(&self, entry: &ManifestEntry) -> LocalFileState;
}

impl LocalStateSource for HashMap<String, LocalFileState> {
    fn state(&self, entry: &ManifestEntry) -> LocalFileState {
        self.get(&entry.path)
            .cloned()
            .unwrap_or_else(|| LocalFileState::absent(&entry.path))
    }
}

impl<T: LocalStateSource + ?Sized> LocalStateSource for &T {
    fn state(&self, entry: &ManifestEntry) -> LocalFileState {
        (**self).state(entry)
    }
}

/// Classify a single entry against its local fingerprint.
pub fn classify(entry: &ManifestEntry, local: &LocalFileState) -> FileStatus {
    if !local.exists {
        return FileStatus::Missing;
    }
    if local.size != Some(entry.size) {
        return FileStatus::Modified;
    }
    match &local.hash {
        Some(h) if entry.hash_matches(h) => FileStatus::Unchanged,
        _ => FileStatus::Modified,
    }
}

/// One result per manifest entry, in manifest order.
pub fn diff<S>(manifest: &Manifest, local: &S, mode: DiffMode) -> Vec<DiffResult>
where
    S: LocalStateSource + ?Sized,
{
    manifest
        .entries()
        .iter()
        .map(|entry| {
            let status = match mode {
                DiffMode::Outdated => classify(entry, &local.state(entry)),
                DiffMode::All { .. } if mode.skips(entry) => FileStatus::Unchanged,
                DiffMode::All { .. } => FileStatus::Missing,
            };
            DiffResult {
                path: entry.path.clone(),
                status,
            }
        })
        .collect()
}

/// Staged files under `archive` that no manifest entry names, sorted by path.
///
/// `staged` holds paths relative to the archive's staging directory.
pub fn extraneous(manifest: &Manifest, archive: &str, staged: &[String]) -> Vec<DiffResult> {
    let found: BTreeSet<String> = staged
        .iter()
        .map(|name| format!("{archive}/{}", PatchPath::normalize(name)))
        .filter(|path| manifest.get(path).is_none())
        .collect();

    found
        .into_iter()
        .map(|path| DiffResult {
            path,
            status: FileStatus::ExtraneousLocal,
        })
        .collect()
}

/// Manifest entries whose diff result asks for a download, in manifest order.
pub fn needing_fetch<'a>(
    manifest: &'a Manifest,
    results: &'a [DiffResult],
) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
    results
        .iter()
        .filter(|r| r.needs_fetch())
        .filter_map(move |r| manifest.get(&r.path))
}
