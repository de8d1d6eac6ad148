use crate::path_utils::PatchPath;
use crate::{Manifest, ManifestEntry, CLIENT_GROUP};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest entry {path} has no {field}")]
    MissingField { path: String, field: &'static str },
    #[error("manifest entry {path} has a malformed hash {hash:?}")]
    InvalidHash { path: String, hash: String },
    #[error("manifest lists {0} more than once")]
    DuplicatePath(String),
    #[error("manifest entry {0} escapes its root")]
    UnsafePath(String),
}

/// Launcher manifest as served by the update API.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManifestDocument {
    #[serde(default)]
    pub client: Vec<WireItem>,
    #[serde(default)]
    pub patches: Vec<WirePatch>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireItem {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mirrors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WirePatch {
    pub key: PatchKey,
    #[serde(default)]
    pub files: Vec<WireItem>,
}

// The API has served patch keys both as strings and as bare numbers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PatchKey {
    Text(String),
    Number(u64),
}

impl PatchKey {
    pub fn archive_name(&self) -> String {
        match self {
            PatchKey::Text(k) => format!("patch-{k}"),
            PatchKey::Number(k) => format!("patch-{k}"),
        }
    }
}

impl WireItem {
    fn is_file(&self) -> bool {
        self.kind.as_deref() == Some("file")
    }

    fn into_entry(self, archive: Option<&str>) -> Result<ManifestEntry, ManifestError> {
        let group = archive.unwrap_or(CLIENT_GROUP);
        let display = format!("{group}/{}", PatchPath::normalize(&self.name));

        let hash = match self.hash {
            Some(h) if !h.trim().is_empty() => h.trim().to_string(),
            _ => {
                return Err(ManifestError::MissingField {
                    path: display,
                    field: "hash",
                })
            }
        };
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ManifestError::InvalidHash {
                path: display,
                hash,
            });
        }
        let size = self.size.ok_or_else(|| ManifestError::MissingField {
            path: display.clone(),
            field: "size",
        })?;

        let mut entry = ManifestEntry::new(&self.name, &hash, size, archive);
        entry.mirrors = self.mirrors;
        Ok(entry)
    }
}

impl ManifestDocument {
    /// Flattens the document into manifest order: client files, then each patch in turn.
    pub fn into_manifest(self) -> Result<Manifest, ManifestError> {
        let mut entries = Vec::new();

        for item in self.client.into_iter().filter(WireItem::is_file) {
            entries.push(item.into_entry(None)?);
        }

        for patch in self.patches {
            let archive = patch.key.archive_name();
            for item in patch.files.into_iter().filter(WireItem::is_file) {
                entries.push(item.into_entry(Some(&archive))?);
            }
        }

        Manifest::from_entries(entries)
    }
}

pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let doc: ManifestDocument = serde_json::from_slice(bytes)?;
    doc.into_manifest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_text_patch_keys_name_the_same_archive() {
        assert_eq!(PatchKey::Number(8).archive_name(), "patch-8");
        assert_eq!(PatchKey::Text("8".into()).archive_name(), "patch-8");
    }
}
