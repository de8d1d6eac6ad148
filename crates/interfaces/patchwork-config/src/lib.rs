//! Central configuration constants for runtime limits and defaults, plus the
//! optional on-disk settings file.

mod mirrors;
mod settings;

pub use mirrors::{ManifestEndpoint, Mirror};
pub use settings::{Settings, SettingsStore};

/// Default number of concurrent downloads.
pub const DEFAULT_WORKERS: usize = 10;

/// Minimum allowed concurrent downloads.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed concurrent downloads.
pub const MAX_WORKERS: usize = 32;

/// Attempts per mirror before falling over to the next one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First retry waits this long; each further retry doubles it.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound of the random delay added to each backoff.
pub const MAX_JITTER_MS: u64 = 1000;

/// Share of failed downloads at which the CDN is reported as out of sync.
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;

pub const DEFAULT_MANIFEST_URL: &str = "https://launcher.turtlecraft.gg/api/manifest";

/// CDN mirrors in fallback order.
pub const MIRROR_ORDER: [&str; 5] = ["r2eu", "bunny", "linode", "r2", "tc"];

pub const DEFAULT_MIRROR: &str = "r2eu";

pub const USER_AGENT: &str = concat!("patchwork/", env!("CARGO_PKG_VERSION"));

pub const CONNECT_TIMEOUT_SECS: u64 = 30;
pub const READ_TIMEOUT_SECS: u64 = 60;

/// File whose presence identifies a game directory.
pub const GAME_MARKER: &str = "WoW.exe";

/// Subdirectory of the game directory holding the shipped archives.
pub const GAME_DATA_DIR: &str = "Data";

pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_OUTPUT_DIR: &str = "mpqs";

/// Failed paths listed in a run summary before truncating.
pub const SUMMARY_FAILURE_LIMIT: usize = 20;

/// Default archive tool: MPQEditor under Wine, one call per staged file.
pub const DEFAULT_ARCHIVE_COMMAND: &str =
    r#"wine MPQEditor.exe /add "{archive}" "{file}" "{member}" /c"#;
pub const DEFAULT_ARCHIVE_CREATE_COMMAND: &str = r#"wine MPQEditor.exe /new "{archive}""#;
/// Reads one member of an installed archive; `/fp` keeps the member's folders.
pub const DEFAULT_ARCHIVE_EXTRACT_COMMAND: &str =
    r#"wine MPQEditor.exe /extract "{archive}" "{member}" "{dir}" /fp"#;

/// Convenience function to clamp a worker count into the allowed range.
pub fn clamp_workers(v: usize) -> usize {
    v.clamp(MIN_WORKERS, MAX_WORKERS)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: camino::Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown mirror '{0}'")]
    UnknownMirror(String),
    #[error("failure threshold must be within 0..=1, got {0}")]
    InvalidThreshold(f64),
    #[error("no manifest endpoint configured")]
    NoManifestEndpoint,
    #[error("could not determine the platform config directory")]
    NoConfigDir,
}
