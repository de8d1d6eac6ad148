pub mod commands;
pub mod context;

use clap::Args;
use patchwork_config::Settings;
use patchwork_core::diff::DiffMode;
use patchwork_pipeline::DownloadOptions;

pub use context::{GlobalOptions, RunContext};

#[derive(Args, Debug, Clone, Default)]
pub struct DownloadArgs {
    /// Download every file in the manifest, not just outdated ones
    #[arg(long)]
    pub all: bool,
    /// With --all, also download the loose .mpq client archives
    #[arg(long, requires = "all")]
    pub include_mpq: bool,
    /// Skip hash verification of downloaded files
    #[arg(long)]
    pub no_verify: bool,
    /// Parallel downloads (1-32)
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Bandwidth limit in MiB/s
    #[arg(long)]
    pub limit_mb: Option<u64>,
}

impl DownloadArgs {
    pub fn options(&self, settings: &Settings) -> DownloadOptions {
        let mode = if self.all {
            DiffMode::All {
                include_containers: self.include_mpq,
            }
        } else {
            DiffMode::Outdated
        };
        DownloadOptions {
            mode,
            verify: !self.no_verify,
            workers: self.workers.unwrap_or_else(|| settings.workers()),
            rate_limit_bytes: self
                .limit_mb
                .map(|mb| mb * 1024 * 1024)
                .or(settings.speed_limit_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let settings = Settings {
            workers: 64,
            speed_limit_bytes: Some(500),
            ..Default::default()
        };

        let defaults = DownloadArgs::default().options(&settings);
        assert_eq!(defaults.mode, DiffMode::Outdated);
        assert_eq!(defaults.workers, 32);
        assert_eq!(defaults.rate_limit_bytes, Some(500));
        assert!(defaults.verify);

        let args = DownloadArgs {
            all: true,
            include_mpq: true,
            no_verify: true,
            workers: Some(4),
            limit_mb: Some(2),
        };
        let opts = args.options(&settings);
        assert_eq!(
            opts.mode,
            DiffMode::All {
                include_containers: true
            }
        );
        assert_eq!(opts.workers, 4);
        assert_eq!(opts.rate_limit_bytes, Some(2 * 1024 * 1024));
        assert!(!opts.verify);
    }
}
