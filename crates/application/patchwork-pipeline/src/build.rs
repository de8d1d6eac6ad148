use crate::io_utils::copy_atomic;
use crate::PipelineError;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, StreamExt};
use patchwork_config::GAME_DATA_DIR;
use patchwork_core::plan::ArchiveBuildPlan;
use patchwork_core::report::BuildReport;
use patchwork_core::{Manifest, ManifestEntry};
use patchwork_infra::archive::{find_installed, ArchiveBuilder, ArchiveInput, ArchiveRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info, warn};

const STATE_FILE: &str = ".patchwork-state.json";

/// Member hashes each archive was last built from, kept in the download
/// directory. A staged member whose hash differs from the recorded one is
/// pending for the next build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    #[serde(default)]
    pub archives: BTreeMap<String, BTreeMap<String, String>>,
}

impl BuildState {
    pub fn path(download_dir: &Utf8Path) -> Utf8PathBuf {
        download_dir.join(STATE_FILE)
    }

    /// A missing or unreadable state file means nothing has been built yet.
    pub fn load(download_dir: &Utf8Path) -> Self {
        let path = Self::path(download_dir);
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring corrupt build state {}: {}", path, e);
            Self::default()
        })
    }

    pub fn save(&self, download_dir: &Utf8Path) -> Result<(), PipelineError> {
        fs::create_dir_all(download_dir)?;
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| PipelineError::State(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(download_dir)?;
        tmp.write_all(&json)?;
        tmp.persist(Self::path(download_dir))
            .map_err(|e| PipelineError::Io(e.error))?;
        Ok(())
    }

    pub fn is_pending(&self, entry: &ManifestEntry) -> bool {
        let Some(archive) = entry.archive.as_deref() else {
            return false;
        };
        self.archives
            .get(archive)
            .and_then(|members| members.get(&entry.path))
            .map_or(true, |recorded| !entry.hash_matches(recorded))
    }

    pub fn record(&mut self, plan: &ArchiveBuildPlan, manifest: &Manifest) {
        let members = self.archives.entry(plan.archive.clone()).or_default();
        for file in &plan.files {
            if let Some(entry) = manifest.get(&file.source) {
                members.insert(entry.path.clone(), entry.hash.clone());
            }
        }
    }
}

/// Applies archive build plans through an `ArchiveBuilder`.
///
/// Each archive is built by exactly one blocking task; independent archives
/// run concurrently up to `concurrency`. A failing archive is recorded in the
/// report and never stops the others.
pub struct BuildCoordinator {
    builder: Arc<dyn ArchiveBuilder>,
    game_dir: Utf8PathBuf,
    download_dir: Utf8PathBuf,
    output_dir: Utf8PathBuf,
    concurrency: usize,
}

impl BuildCoordinator {
    pub fn new(
        builder: Arc<dyn ArchiveBuilder>,
        game_dir: impl Into<Utf8PathBuf>,
        download_dir: impl Into<Utf8PathBuf>,
        output_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            builder,
            game_dir: game_dir.into(),
            download_dir: download_dir.into(),
            output_dir: output_dir.into(),
            concurrency: 2,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn output_path(&self, plan: &ArchiveBuildPlan) -> Utf8PathBuf {
        self.output_dir.join(plan.file_name())
    }

    fn request(&self, plan: &ArchiveBuildPlan) -> ArchiveRequest {
        ArchiveRequest {
            archive: plan.archive.clone(),
            output_path: self.output_path(plan),
            source_dir: self.download_dir.join(&plan.archive),
            files: plan
                .files
                .iter()
                .map(|f| ArchiveInput {
                    source: self.download_dir.join(&f.source),
                    member: f.member.clone(),
                })
                .collect(),
            force_rebuild: plan.force_rebuild,
        }
    }

    /// Build every plan and record successful ones in the build state.
    pub async fn build(
        &self,
        plans: Vec<ArchiveBuildPlan>,
        manifest: &Manifest,
    ) -> Result<BuildReport, PipelineError> {
        let mut report = BuildReport::default();
        if plans.is_empty() {
            info!("No archives need rebuilding");
            return Ok(report);
        }
        fs::create_dir_all(&self.output_dir)?;

        let mut runnable = Vec::new();
        for plan in plans {
            if plan.files.is_empty() {
                info!("{}: nothing staged, skipping", plan.archive);
                report.skipped.insert(plan.archive.clone());
            } else {
                runnable.push(plan);
            }
        }

        let data_dir = self.game_dir.join(GAME_DATA_DIR);
        let outcomes: Vec<(ArchiveBuildPlan, Result<usize, String>)> = stream::iter(runnable)
            .map(|plan| {
                let builder = self.builder.clone();
                let request = self.request(&plan);
                let data_dir = data_dir.clone();
                async move {
                    let archive = plan.archive.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        build_one(builder.as_ref(), &request, &data_dir)
                    })
                    .await;
                    let outcome = match joined {
                        Ok(res) => res,
                        Err(e) => Err(format!("build task for {archive} failed: {e}")),
                    };
                    (plan, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut state = BuildState::load(&self.download_dir);
        let mut state_changed = false;
        for (plan, outcome) in outcomes {
            match outcome {
                Ok(written) => {
                    info!("Built {} ({} files)", plan.file_name(), written);
                    state.record(&plan, manifest);
                    state_changed = true;
                    report.built.insert(plan.archive);
                }
                Err(message) => {
                    error!("Failed to build {}: {}", plan.file_name(), message);
                    report.failed.insert(plan.archive, message);
                }
            }
        }
        if state_changed {
            state.save(&self.download_dir)?;
        }

        Ok(report)
    }
}

fn build_one(
    builder: &dyn ArchiveBuilder,
    request: &ArchiveRequest,
    data_dir: &Utf8Path,
) -> Result<usize, String> {
    if !request.output_path.exists() {
        let file_name = request.output_path.file_name().unwrap_or_default();
        match find_installed(data_dir, file_name) {
            Some(seed) => {
                info!("Seeding {} from {}", request.output_path, seed);
                copy_atomic(&seed, &request.output_path)
                    .map_err(|e| format!("copying seed {seed}: {e}"))?;
            }
            None => info!("{}: no shipped archive, creating new", request.archive),
        }
    }

    builder
        .apply(request)
        .map(|applied| applied.files_written)
        .map_err(|e| e.to_string())
}
