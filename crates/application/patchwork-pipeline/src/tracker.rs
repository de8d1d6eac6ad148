use patchwork_core::plan::DownloadTask;
use patchwork_infra::net::DownloadEvent;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

const SPEED_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ActiveDownload {
    pub id: u64,
    pub file_name: String,
    pub group: String,
    pub path: String,
    pub received: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransferSnapshot {
    pub files_total: u64,
    pub files_done: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub retries: u64,
    /// Average over the last few seconds.
    pub bytes_per_sec: u64,
    /// Ordered by task index.
    pub in_flight: Vec<ActiveDownload>,
}

/// Folds downloader events into totals for a progress display. Event ids are
/// task indices, as assigned by `TaskExecutor`.
pub struct ProgressTracker {
    tasks: Vec<(String, String)>,
    active: BTreeMap<u64, ActiveDownload>,
    totals: TransferSnapshot,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    pub fn new(tasks: &[DownloadTask]) -> Self {
        let totals = TransferSnapshot {
            files_total: tasks.len() as u64,
            bytes_total: tasks.iter().map(|t| t.entry.size).sum(),
            ..Default::default()
        };
        Self {
            tasks: tasks
                .iter()
                .map(|t| (t.entry.group().to_string(), t.entry.path.clone()))
                .collect(),
            active: BTreeMap::new(),
            totals,
            samples: VecDeque::new(),
        }
    }

    pub fn update(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Started { id, total_bytes } => {
                let Some((group, path)) = self.tasks.get(id as usize) else {
                    return;
                };
                let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
                self.active.insert(
                    id,
                    ActiveDownload {
                        id,
                        file_name,
                        group: group.clone(),
                        path: path.clone(),
                        received: 0,
                        size: total_bytes,
                    },
                );
            }
            DownloadEvent::Progress { id, bytes_delta } => {
                self.totals.bytes_done += bytes_delta;
                self.samples.push_back((Instant::now(), bytes_delta));
                if let Some(active) = self.active.get_mut(&id) {
                    active.received += bytes_delta;
                }
            }
            DownloadEvent::Retrying {
                id,
                discarded_bytes,
                ..
            } => {
                self.totals.retries += 1;
                self.totals.bytes_done = self.totals.bytes_done.saturating_sub(discarded_bytes);
                if let Some(active) = self.active.get_mut(&id) {
                    active.received = 0;
                }
            }
            DownloadEvent::Completed { id, success } => {
                self.active.remove(&id);
                if success {
                    self.totals.files_done += 1;
                } else {
                    self.totals.files_failed += 1;
                }
            }
        }
    }

    fn speed(&mut self, now: Instant) -> u64 {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let Some((first, _)) = self.samples.front() else {
            return 0;
        };
        let span = now.duration_since(*first).as_secs_f64().max(0.5);
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        (bytes as f64 / span) as u64
    }

    pub fn snapshot(&mut self) -> TransferSnapshot {
        let bytes_per_sec = self.speed(Instant::now());
        TransferSnapshot {
            bytes_per_sec,
            in_flight: self.active.values().cloned().collect(),
            ..self.totals.clone()
        }
    }
}
