use crate::{
    ConfigError, ManifestEndpoint, Mirror, DEFAULT_ARCHIVE_COMMAND, DEFAULT_ARCHIVE_CREATE_COMMAND,
    DEFAULT_ARCHIVE_EXTRACT_COMMAND, DEFAULT_BACKOFF_BASE_MS, DEFAULT_DOWNLOAD_DIR,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_RETRIES, DEFAULT_MIRROR, DEFAULT_OUTPUT_DIR,
    DEFAULT_WORKERS,
};
use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use tracing::debug;

const QUALIFIER: &str = "gg";
const ORG: &str = "patchwork";
const APP: &str = "patchwork";
const SETTINGS_FILE: &str = "settings.json";

/// Everything a run can be configured with. Missing keys fall back to the
/// defaults, so a settings file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub game_dir: Option<Utf8PathBuf>,
    pub download_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    /// Mirror tried first; the rest follow in `mirrors` order.
    pub mirror: String,
    pub mirrors: Vec<Mirror>,
    pub manifest_endpoints: Vec<ManifestEndpoint>,
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub failure_threshold: f64,
    pub speed_limit_bytes: Option<u64>,
    pub archive_command: String,
    pub archive_create_command: Option<String>,
    /// Reads members of the installed archives; `None` compares staged copies only.
    pub archive_extract_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            game_dir: None,
            download_dir: DEFAULT_DOWNLOAD_DIR.into(),
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            mirror: DEFAULT_MIRROR.into(),
            mirrors: Mirror::defaults(),
            manifest_endpoints: ManifestEndpoint::defaults(),
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            speed_limit_bytes: None,
            archive_command: DEFAULT_ARCHIVE_COMMAND.into(),
            archive_create_command: Some(DEFAULT_ARCHIVE_CREATE_COMMAND.into()),
            archive_extract_command: Some(DEFAULT_ARCHIVE_EXTRACT_COMMAND.into()),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.mirrors.iter().any(|m| m.name == self.mirror) {
            return Err(ConfigError::UnknownMirror(self.mirror.clone()));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ConfigError::InvalidThreshold(self.failure_threshold));
        }
        if self.manifest_endpoints.is_empty() {
            return Err(ConfigError::NoManifestEndpoint);
        }
        Ok(())
    }

    /// Preferred mirror first, then the others in configured order.
    pub fn mirror_order(&self) -> Vec<Mirror> {
        let preferred = self.mirrors.iter().filter(|m| m.name == self.mirror);
        let rest = self.mirrors.iter().filter(|m| m.name != self.mirror);
        preferred.chain(rest).cloned().collect()
    }

    pub fn workers(&self) -> usize {
        crate::clamp_workers(self.workers)
    }
}

pub struct SettingsStore;

impl SettingsStore {
    /// `<platform config dir>/settings.json`.
    pub fn default_path() -> Result<Utf8PathBuf, ConfigError> {
        let proj_dirs = ProjectDirs::from(QUALIFIER, ORG, APP).ok_or(ConfigError::NoConfigDir)?;
        let dir = Utf8PathBuf::from_path_buf(proj_dirs.config_dir().to_path_buf())
            .map_err(|_| ConfigError::NoConfigDir)?;
        Ok(dir.join(SETTINGS_FILE))
    }

    /// Read and validate a settings file; a missing file yields the defaults.
    pub fn load(path: &Utf8Path) -> Result<Settings, ConfigError> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path);
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(path: &Utf8Path, settings: &Settings) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        atomic_write(path, json.as_bytes()).map_err(io_err)
    }
}

fn atomic_write(path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            fs::remove_file(path).ok();
            fs::rename(&tmp_path, path)
        }
        Err(e) => {
            fs::remove_file(&tmp_path).ok();
            Err(e)
        }
    }
}
