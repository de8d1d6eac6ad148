use crate::build::{BuildCoordinator, BuildState};
use crate::execute::{ExecuteOptions, TaskExecutor};
use crate::io_utils::count_files;
use crate::remote::ManifestSource;
use crate::PipelineError;
use camino::Utf8PathBuf;
use patchwork_config::{clamp_workers, Mirror, Settings, GAME_DATA_DIR, MAX_JITTER_MS};
use patchwork_core::diff::{diff, extraneous, DiffMode, DiffResult};
use patchwork_core::plan::{plan_archive_builds, DownloadTask};
use patchwork_core::report::{BuildReport, RunReport};
use patchwork_core::{Manifest, ManifestEntry, CLIENT_GROUP};
use patchwork_infra::archive::{ArchiveBuilder, ArchiveReader};
use patchwork_infra::net::{DownloadEvent, RetryPolicy};
use patchwork_scanner::{LocalScanner, ProgressCb, ScanStats, ScannerError};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub game_dir: Utf8PathBuf,
    pub download_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    /// Mirrors in the order they are tried.
    pub mirrors: Vec<Mirror>,
    pub retry: RetryPolicy,
    pub build_concurrency: usize,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings, game_dir: Utf8PathBuf) -> Self {
        Self {
            game_dir,
            download_dir: settings.download_dir.clone(),
            output_dir: settings.output_dir.clone(),
            mirrors: settings.mirror_order(),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: Duration::from_millis(settings.backoff_base_ms),
                max_jitter: Duration::from_millis(MAX_JITTER_MS),
            },
            build_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub mode: DiffMode,
    pub verify: bool,
    pub workers: usize,
    pub rate_limit_bytes: Option<u64>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            mode: DiffMode::Outdated,
            verify: true,
            workers: patchwork_config::DEFAULT_WORKERS,
            rate_limit_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// One result per manifest entry, in manifest order.
    pub results: Vec<DiffResult>,
    pub extraneous: Vec<DiffResult>,
    pub stats: ScanStats,
}

impl CheckOutcome {
    pub fn outdated(&self) -> impl Iterator<Item = &DiffResult> {
        self.results.iter().filter(|r| r.needs_fetch())
    }

    pub fn is_up_to_date(&self) -> bool {
        self.outdated().next().is_none()
    }
}

/// Diff results plus the tasks derived from them, ready to execute.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub results: Vec<DiffResult>,
    pub tasks: Vec<DownloadTask>,
    pub report: RunReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub removed: Vec<Utf8PathBuf>,
}

/// Entry point for every command: check, download, build, update, clean.
pub struct PatchEngine {
    client: reqwest::Client,
    source: Arc<dyn ManifestSource>,
    builder: Arc<dyn ArchiveBuilder>,
    reader: Option<Arc<dyn ArchiveReader>>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl PatchEngine {
    pub fn new(
        client: reqwest::Client,
        source: Arc<dyn ManifestSource>,
        builder: Arc<dyn ArchiveBuilder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            source,
            builder,
            reader: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Compare archive members against the installed archives under
    /// `<game_dir>/Data` as well as against staged copies.
    pub fn with_archive_reader(mut self, reader: Arc<dyn ArchiveReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn fetch_manifest(&self) -> Result<Manifest, PipelineError> {
        self.source.fetch_manifest().await
    }

    fn scanner(&self) -> Arc<LocalScanner> {
        let scanner = LocalScanner::new(
            self.config.game_dir.clone(),
            self.config.download_dir.clone(),
        );
        Arc::new(match &self.reader {
            Some(reader) => {
                let data_dir = self.config.game_dir.join(GAME_DATA_DIR);
                scanner.with_installed_archives(data_dir, reader.clone())
            }
            None => scanner,
        })
    }

    async fn scan(
        &self,
        scanner: Arc<LocalScanner>,
        entries: Vec<ManifestEntry>,
        on_progress: Option<ProgressCb>,
    ) -> Result<ScanStats, PipelineError> {
        let flag = Arc::new(AtomicBool::new(self.cancel.is_cancelled()));
        let watcher = {
            let flag = flag.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::Relaxed);
            })
        };

        let res = tokio::task::spawn_blocking(move || {
            scanner.prefetch(&entries, on_progress, Some(flag))
        })
        .await;
        watcher.abort();

        match res {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(ScannerError::Cancelled)) => Err(PipelineError::Cancelled),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }

    fn extraneous(
        &self,
        manifest: &Manifest,
        scanner: &LocalScanner,
    ) -> Result<Vec<DiffResult>, PipelineError> {
        let mut out = Vec::new();
        for archive in manifest.archives() {
            let staged = scanner.staged_files(archive)?;
            out.extend(extraneous(manifest, archive, &staged));
        }
        Ok(out)
    }

    /// Scan the game and staging directories and classify every entry.
    pub async fn check(
        &self,
        manifest: &Manifest,
        on_progress: Option<ProgressCb>,
    ) -> Result<CheckOutcome, PipelineError> {
        let scanner = self.scanner();
        let stats = self
            .scan(scanner.clone(), manifest.entries().to_vec(), on_progress)
            .await?;
        let results = diff(manifest, scanner.as_ref(), DiffMode::Outdated);
        let extraneous = self.extraneous(manifest, &scanner)?;

        info!(
            "Checked {} files: {} outdated, {} extraneous",
            results.len(),
            results.iter().filter(|r| r.needs_fetch()).count(),
            extraneous.len()
        );
        Ok(CheckOutcome {
            results,
            extraneous,
            stats,
        })
    }

    /// Decide what to fetch. `All` mode skips the scan entirely.
    pub async fn plan_download(
        &self,
        manifest: &Manifest,
        mode: DiffMode,
    ) -> Result<DownloadPlan, PipelineError> {
        let scanner = self.scanner();
        if mode == DiffMode::Outdated {
            self.scan(scanner.clone(), manifest.entries().to_vec(), None)
                .await?;
        }
        let results = diff(manifest, scanner.as_ref(), mode);

        let mut report = RunReport::from_diff(manifest, &results, mode);
        for r in self.extraneous(manifest, &scanner)? {
            report.extraneous.insert(r.path);
        }
        let tasks = DownloadTask::from_diff(manifest, &results);

        Ok(DownloadPlan {
            results,
            tasks,
            report,
        })
    }

    pub async fn execute_download(
        &self,
        plan: DownloadPlan,
        opts: &DownloadOptions,
        progress_tx: Option<Sender<DownloadEvent>>,
    ) -> RunReport {
        let mut report = plan.report;
        if plan.tasks.is_empty() {
            info!("Nothing to download");
            return report;
        }

        let executor = TaskExecutor::new(
            self.client.clone(),
            self.config.download_dir.clone(),
            self.config.mirrors.clone(),
        )
        .with_cancellation(self.cancel.clone());

        let exec_opts = ExecuteOptions {
            workers: clamp_workers(opts.workers),
            verify: opts.verify,
            rate_limit_bytes: opts.rate_limit_bytes,
            retry: self.config.retry,
        };
        let mut tasks = plan.tasks;
        let results = executor.execute(&mut tasks, &exec_opts, progress_tx).await;
        report.extend(&results);

        if self.cancel.is_cancelled() {
            warn!("Download cancelled; finished files were kept");
        }
        info!(
            "Download finished: {} updated, {} cached, {} failed",
            report.updated_count(),
            report.cached.len(),
            report.failed_count()
        );
        report
    }

    pub async fn download(
        &self,
        manifest: &Manifest,
        opts: &DownloadOptions,
        progress_tx: Option<Sender<DownloadEvent>>,
    ) -> Result<RunReport, PipelineError> {
        let plan = self.plan_download(manifest, opts.mode).await?;
        Ok(self.execute_download(plan, opts, progress_tx).await)
    }

    /// Rebuild archives whose members changed.
    ///
    /// A member counts as changed when `report` says it was fetched this run,
    /// or when its verified staged copy differs from what the archive was last
    /// built from. With `force` every archive is rebuilt from all verified
    /// staged members.
    pub async fn build(
        &self,
        manifest: &Manifest,
        report: Option<&RunReport>,
        force: bool,
    ) -> Result<BuildReport, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let members: Vec<ManifestEntry> = manifest
            .entries()
            .iter()
            .filter(|e| e.archive.is_some())
            .cloned()
            .collect();
        let scanner = self.scanner();
        self.scan(scanner.clone(), members.clone(), None).await?;

        let state = BuildState::load(&self.config.download_dir);
        let mut effective = report.cloned().unwrap_or_default();
        for entry in &members {
            if !effective.is_succeeded(&entry.path)
                && state.is_pending(entry)
                && scanner.is_staged(entry)
            {
                effective.cached.insert(entry.path.clone());
            }
        }

        let plans = plan_archive_builds(manifest, &effective, force, |e| scanner.is_staged(e));
        info!("{} archive(s) to build", plans.len());

        BuildCoordinator::new(
            self.builder.clone(),
            self.config.game_dir.clone(),
            self.config.download_dir.clone(),
            self.config.output_dir.clone(),
        )
        .with_concurrency(self.config.build_concurrency)
        .build(plans, manifest)
        .await
    }

    /// Download, then build from this run's report. Archives are built even
    /// when some downloads failed, from whatever was staged.
    pub async fn update(
        &self,
        manifest: &Manifest,
        opts: &DownloadOptions,
        force: bool,
        progress_tx: Option<Sender<DownloadEvent>>,
    ) -> Result<(RunReport, BuildReport), PipelineError> {
        let report = self.download(manifest, opts, progress_tx).await?;
        let built = self.build(manifest, Some(&report), force).await?;
        Ok((report, built))
    }

    /// Remove staged groups, the build state and the output directory.
    pub fn clean(&self) -> Result<CleanReport, PipelineError> {
        let mut report = CleanReport::default();
        let download_dir = &self.config.download_dir;

        let output_dir = &self.config.output_dir;
        if output_dir.is_dir() {
            report.files_removed += count_files(output_dir);
            fs::remove_dir_all(output_dir)?;
            report.dirs_removed += 1;
            report.removed.push(output_dir.clone());
        }

        let state = BuildState::path(download_dir);
        if state.is_file() {
            fs::remove_file(&state)?;
            report.files_removed += 1;
            report.removed.push(state);
        }

        if download_dir.is_dir() {
            for entry in fs::read_dir(download_dir)? {
                let entry = entry?;
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                    continue;
                };
                let is_group = path
                    .file_name()
                    .is_some_and(|n| n == CLIENT_GROUP || n.starts_with("patch-"));
                if is_group && path.is_dir() {
                    report.files_removed += count_files(&path);
                    fs::remove_dir_all(&path)?;
                    report.dirs_removed += 1;
                    report.removed.push(path);
                }
            }

            if fs::read_dir(download_dir)?.next().is_none() {
                fs::remove_dir(download_dir)?;
                report.dirs_removed += 1;
                report.removed.push(download_dir.clone());
            }
        }

        info!(
            "Clean removed {} files, {} directories",
            report.files_removed, report.dirs_removed
        );
        Ok(report)
    }
}
