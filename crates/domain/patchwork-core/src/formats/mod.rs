pub mod manifest;

pub use manifest::{parse_manifest, ManifestDocument, ManifestError};
