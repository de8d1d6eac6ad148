use crate::{DEFAULT_MANIFEST_URL, MIRROR_ORDER};
use serde::{Deserialize, Serialize};

/// A CDN serving manifest files.
///
/// Entries usually carry an explicit URL per mirror; `base_url` is only used
/// for entries that don't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Mirror {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: None,
        }
    }

    pub fn defaults() -> Vec<Self> {
        MIRROR_ORDER.iter().map(|n| Self::named(n)).collect()
    }
}

/// Where the manifest document itself is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEndpoint {
    pub name: String,
    pub url: String,
}

impl ManifestEndpoint {
    pub fn defaults() -> Vec<Self> {
        vec![Self {
            name: "launcher".into(),
            url: DEFAULT_MANIFEST_URL.into(),
        }]
    }
}
