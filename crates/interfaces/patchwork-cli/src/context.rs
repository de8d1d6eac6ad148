use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use patchwork_config::{
    Settings, SettingsStore, CONNECT_TIMEOUT_SECS, GAME_MARKER, READ_TIMEOUT_SECS, USER_AGENT,
};
use patchwork_infra::archive::{CommandArchiveBuilder, CommandArchiveReader};
use patchwork_infra::net::default_http_client;
use patchwork_pipeline::{EngineConfig, HttpManifestSource, PatchEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Options shared by every subcommand. Flags win over the settings file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Game installation directory (contains WoW.exe)
    #[arg(long, global = true, env = "PATCHWORK_GAME_DIR")]
    pub game_dir: Option<Utf8PathBuf>,
    /// Staging directory for downloaded files
    #[arg(long, global = true, env = "PATCHWORK_DOWNLOAD_DIR")]
    pub download_dir: Option<Utf8PathBuf>,
    /// Where rebuilt archives are written
    #[arg(long, global = true, env = "PATCHWORK_OUTPUT_DIR")]
    pub output_dir: Option<Utf8PathBuf>,
    /// Preferred CDN mirror
    #[arg(long, global = true, env = "PATCHWORK_MIRROR")]
    pub mirror: Option<String>,
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true, env = "PATCHWORK_CONFIG")]
    pub config: Option<Utf8PathBuf>,
}

/// Settings resolved for one invocation.
pub struct RunContext {
    pub settings: Settings,
    game_dir: Option<Utf8PathBuf>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn load(opts: &GlobalOptions, cancel: CancellationToken) -> Result<Self> {
        let path = match &opts.config {
            Some(p) => Some(p.clone()),
            None => SettingsStore::default_path().ok(),
        };
        let mut settings = match &path {
            Some(p) => SettingsStore::load(p)
                .with_context(|| format!("Failed to load settings from {p}"))?,
            None => Settings::default(),
        };

        if let Some(dir) = &opts.download_dir {
            settings.download_dir = dir.clone();
        }
        if let Some(dir) = &opts.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Some(mirror) = &opts.mirror {
            settings.mirror = mirror.clone();
        }
        settings.validate().context("Invalid configuration")?;
        debug!("Resolved settings: {:?}", settings);

        let game_dir = opts.game_dir.clone().or_else(|| settings.game_dir.clone());
        Ok(Self {
            settings,
            game_dir,
            cancel,
        })
    }

    pub fn game_dir(&self) -> Result<&Utf8Path> {
        match &self.game_dir {
            Some(dir) => Ok(dir),
            None => bail!("No game directory given (use --game-dir or PATCHWORK_GAME_DIR)"),
        }
    }

    /// The game directory, checked for the client executable.
    pub fn validated_game_dir(&self) -> Result<&Utf8Path> {
        let dir = self.game_dir()?;
        if !dir.is_dir() {
            bail!("Game directory does not exist: {dir}");
        }
        if !dir.join(GAME_MARKER).is_file() {
            bail!("{GAME_MARKER} not found in {dir}; is this a game installation?");
        }
        Ok(dir)
    }

    pub fn engine(&self) -> Result<PatchEngine> {
        let game_dir = self.validated_game_dir()?.to_owned();
        self.build_engine(game_dir)
    }

    /// An engine for commands that never touch the game directory.
    pub fn staging_engine(&self) -> Result<PatchEngine> {
        self.build_engine(self.game_dir.clone().unwrap_or_default())
    }

    fn build_engine(&self, game_dir: Utf8PathBuf) -> Result<PatchEngine> {
        let client = default_http_client(
            USER_AGENT,
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
        .context("Failed to build HTTP client")?;

        let source = HttpManifestSource::new(client.clone(), self.settings.manifest_endpoints.clone());
        let builder = CommandArchiveBuilder::new(self.settings.archive_command.clone())
            .with_create_template(self.settings.archive_create_command.clone());

        let mut engine = PatchEngine::new(
            client,
            Arc::new(source),
            Arc::new(builder),
            EngineConfig::from_settings(&self.settings, game_dir),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(template) = &self.settings.archive_extract_command {
            let reader = CommandArchiveReader::new(template.clone());
            engine = engine.with_archive_reader(Arc::new(reader));
        }
        Ok(engine)
    }
}
