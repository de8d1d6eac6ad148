use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub mod diff;
pub mod formats;
pub mod path_utils;
pub mod plan;
pub mod report;

pub use formats::ManifestError;

use path_utils::PatchPath;

/// Upper-case hex SHA-256 digest as published by the manifest.
pub type Sha256Digest = String;

/// Group name for loose game files that do not live inside an archive.
pub const CLIENT_GROUP: &str = "client";

/// File extension of the output containers.
pub const ARCHIVE_EXTENSION: &str = "mpq";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Archive-qualified identity: `<group>/<name>`.
    pub path: String,
    /// Path relative to the group (game dir for client files, archive root for members).
    pub name: String,
    pub hash: Sha256Digest,
    pub size: u64,
    /// Output container this entry belongs to. `None` for loose client files.
    pub archive: Option<String>,
    /// Explicit per-mirror download URLs, keyed by mirror name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, String>,
}

impl ManifestEntry {
    pub fn new(
        name: &str,
        hash: &str,
        size: u64,
        archive: Option<&str>,
    ) -> Self {
        let name = PatchPath::normalize(name);
        let group = archive.unwrap_or(CLIENT_GROUP);
        Self {
            path: format!("{group}/{name}"),
            name,
            hash: hash.to_ascii_uppercase(),
            size,
            archive: archive.map(str::to_string),
            mirrors: BTreeMap::new(),
        }
    }

    pub fn with_mirror(mut self, mirror: &str, url: &str) -> Self {
        self.mirrors.insert(mirror.to_string(), url.to_string());
        self
    }

    pub fn group(&self) -> &str {
        self.archive.as_deref().unwrap_or(CLIENT_GROUP)
    }

    /// A loose archive file shipped whole (e.g. `Data/patch-3.mpq`).
    pub fn is_container(&self) -> bool {
        self.archive.is_none()
            && std::path::Path::new(&self.name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
    }

    /// Name of this entry inside its container (backslash separated).
    pub fn member_name(&self) -> String {
        PatchPath::to_member(&self.name)
    }

    pub fn hash_matches(&self, other: &str) -> bool {
        self.hash.eq_ignore_ascii_case(other)
    }
}

/// Ordered, read-only listing of every tracked file for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    index: HashMap<String, usize>,
}

impl Manifest {
    /// Builds a manifest, rejecting entries whose paths collide.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Result<Self, ManifestError> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if !PatchPath::verify_safe(&entry.name) {
                return Err(ManifestError::UnsafePath(entry.path.clone()));
            }
            if index
                .insert(PatchPath::canonicalize(&entry.path), i)
                .is_some()
            {
                return Err(ManifestError::DuplicatePath(entry.path.clone()));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.index
            .get(&PatchPath::canonicalize(path))
            .map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every archive named by at least one entry.
    pub fn archives(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.archive.as_deref())
            .collect()
    }

    pub fn members<'a>(&'a self, archive: &'a str) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .iter()
            .filter(move |e| e.archive.as_deref() == Some(archive))
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Fingerprint of one referenced path on the local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileState {
    pub path: String,
    pub exists: bool,
    pub size: Option<u64>,
    /// Only computed when the size already matches the manifest.
    pub hash: Option<Sha256Digest>,
    /// Set when the file exists but could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreadable: Option<String>,
}

impl LocalFileState {
    pub fn absent(path: &str) -> Self {
        Self {
            path: path.to_string(),
            exists: false,
            size: None,
            hash: None,
            unreadable: None,
        }
    }

    pub fn unreadable(path: &str, reason: String) -> Self {
        Self {
            unreadable: Some(reason),
            ..Self::absent(path)
        }
    }
}
