use camino::{Utf8Path, Utf8PathBuf};
use patchwork_config::Mirror;
use patchwork_core::path_utils::PatchPath;
use patchwork_core::plan::DownloadTask;
use patchwork_core::report::{DownloadOutcome, DownloadResult, FailureReason};
use patchwork_core::ManifestEntry;
use patchwork_infra::net::{
    self, DownloadEvent, DownloadRequest, Downloader, FetchError, MirrorUrl, RetryPolicy,
};
use std::collections::HashMap;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn validate_destination(root: &Utf8Path, destination: &str) -> Result<Utf8PathBuf, String> {
    if !PatchPath::verify_safe(destination) {
        return Err(format!("Security: unsafe destination '{destination}'"));
    }
    let target = root.join(PatchPath::normalize(destination));
    if !target.starts_with(root) {
        return Err(format!("Security: destination escapes root: {target}"));
    }
    Ok(target)
}

/// Candidate URLs for `entry`: configured mirrors first (preferred one
/// leading), then any extra mirrors the manifest names.
pub fn candidate_urls(entry: &ManifestEntry, mirrors: &[Mirror]) -> Vec<MirrorUrl> {
    let mut urls: Vec<MirrorUrl> = mirrors
        .iter()
        .filter_map(|m| {
            let url = match (entry.mirrors.get(&m.name), &m.base_url) {
                (Some(explicit), _) => explicit.clone(),
                (None, Some(base)) => net::mirror_file_url(base, &entry.path),
                (None, None) => return None,
            };
            Some(MirrorUrl {
                mirror: m.name.clone(),
                url,
            })
        })
        .collect();

    for (name, url) in &entry.mirrors {
        if !mirrors.iter().any(|m| &m.name == name) {
            urls.push(MirrorUrl {
                mirror: name.clone(),
                url: url.clone(),
            });
        }
    }
    urls
}

pub fn failure_reason(err: FetchError) -> FailureReason {
    match err {
        FetchError::Network(message) => FailureReason::Network { message },
        FetchError::Status { status, .. } => FailureReason::HttpStatus { status },
        FetchError::HashMismatch { expected, actual } => {
            FailureReason::HashMismatch { expected, actual }
        }
        FetchError::Io { path, message } => FailureReason::Filesystem {
            message: format!("{path}: {message}"),
        },
        FetchError::NoMirror => FailureReason::NoMirror,
        FetchError::Cancelled => FailureReason::Cancelled,
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub workers: usize,
    pub verify: bool,
    pub rate_limit_bytes: Option<u64>,
    pub retry: RetryPolicy,
}

/// Turns download tasks into downloader requests and the downloader's answers
/// back into per-path results.
pub struct TaskExecutor {
    client: reqwest::Client,
    download_dir: Utf8PathBuf,
    mirrors: Vec<Mirror>,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        client: reqwest::Client,
        download_dir: impl Into<Utf8PathBuf>,
        mirrors: Vec<Mirror>,
    ) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
            mirrors,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every task. Returns one result per task, in task order, and adds
    /// the transfer attempts made to each task's `attempt`. Tasks that fail the
    /// path check or have no source are failed without any transfer.
    pub async fn execute(
        &self,
        tasks: &mut [DownloadTask],
        opts: &ExecuteOptions,
        progress_tx: Option<Sender<DownloadEvent>>,
    ) -> Vec<DownloadResult> {
        let mut results: Vec<Option<DownloadResult>> = vec![None; tasks.len()];
        let mut requests = Vec::new();
        let mut paths = HashMap::new();

        for (i, task) in tasks.iter().enumerate() {
            let failed = |reason| {
                Some(DownloadResult {
                    path: task.entry.path.clone(),
                    outcome: DownloadOutcome::Failed {
                        reason,
                        attempts: task.attempt,
                    },
                })
            };

            let target = match validate_destination(&self.download_dir, &task.destination) {
                Ok(target) => target,
                Err(message) => {
                    warn!("{}", message);
                    results[i] = failed(FailureReason::Rejected { message });
                    continue;
                }
            };

            let urls = candidate_urls(&task.entry, &self.mirrors);
            if urls.is_empty() {
                results[i] = failed(FailureReason::NoMirror);
                continue;
            }

            let id = i as u64;
            paths.insert(id, PatchPath::normalize(&task.destination));
            requests.push(DownloadRequest {
                id,
                urls,
                target_path: target,
                expected_size: task.entry.size,
                expected_hash: opts.verify.then(|| task.entry.hash.clone()),
            });
        }

        info!(
            "Downloading {} files with {} workers{}",
            requests.len(),
            opts.workers,
            if opts.verify { "" } else { " (verification disabled)" }
        );

        let downloader = Downloader::new(self.client.clone(), opts.workers, opts.rate_limit_bytes)
            .with_retry_policy(opts.retry)
            .with_cancellation(self.cancel.clone());

        for res in downloader.download_batch(requests, progress_tx).await {
            let idx = res.id as usize;
            let Some(task) = tasks.get_mut(idx) else {
                continue;
            };
            task.attempt += res.attempts;
            let outcome = match res.outcome {
                Ok(fetched) => DownloadOutcome::Success {
                    destination: paths.remove(&res.id).unwrap_or_default(),
                    bytes: fetched.bytes,
                    mirror: fetched.mirror,
                    cached: fetched.cached,
                    verified: fetched.verified,
                },
                Err(e) => DownloadOutcome::Failed {
                    reason: failure_reason(e),
                    attempts: task.attempt,
                },
            };
            results[idx] = Some(DownloadResult {
                path: task.entry.path.clone(),
                outcome,
            });
        }

        results.into_iter().flatten().collect()
    }
}
