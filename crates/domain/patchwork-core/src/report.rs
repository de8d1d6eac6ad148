use crate::diff::{DiffMode, DiffResult, FileStatus};
use crate::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Why a single file ended in `Failed` after every retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("server answered HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("filesystem error: {message}")]
    Filesystem { message: String },
    #[error("no configured mirror serves this file")]
    NoMirror,
    #[error("cancelled")]
    Cancelled,
    #[error("rejected: {message}")]
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    Success {
        /// Download-directory-relative location of the verified file.
        destination: String,
        bytes: u64,
        mirror: Option<String>,
        /// The destination already held matching content; nothing was transferred.
        cached: bool,
        verified: bool,
    },
    Failed {
        reason: FailureReason,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub path: String,
    #[serde(flatten)]
    pub outcome: DownloadOutcome,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Success { .. })
    }
}

/// Per-invocation summary. Built from sums and ordered sets only, so the
/// order in which workers finish never changes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Entries whose local copy was checked and found current.
    pub unchanged: usize,
    /// Entries the mode left alone without checking, e.g. containers in `All` mode.
    pub skipped: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub cached: BTreeSet<String>,
    pub unverified: BTreeSet<String>,
    pub failed: BTreeMap<String, FailureReason>,
    pub extraneous: BTreeSet<String>,
    pub bytes_downloaded: u64,
}

impl RunReport {
    /// Seed the report with the classifications that need no download.
    pub fn from_diff(manifest: &Manifest, results: &[DiffResult], mode: DiffMode) -> Self {
        let mut report = Self::default();
        for r in results {
            match r.status {
                FileStatus::Unchanged => {
                    if manifest.get(&r.path).is_some_and(|e| mode.skips(e)) {
                        report.skipped.insert(r.path.clone());
                    } else {
                        report.unchanged += 1;
                    }
                }
                FileStatus::ExtraneousLocal => {
                    report.extraneous.insert(r.path.clone());
                }
                FileStatus::Missing | FileStatus::Modified => {}
            }
        }
        report
    }

    pub fn record(&mut self, result: &DownloadResult) {
        match &result.outcome {
            DownloadOutcome::Success {
                bytes,
                cached,
                verified,
                ..
            } => {
                if *cached {
                    self.cached.insert(result.path.clone());
                } else {
                    self.updated.insert(result.path.clone());
                    self.bytes_downloaded += bytes;
                }
                if !verified {
                    self.unverified.insert(result.path.clone());
                }
            }
            DownloadOutcome::Failed { reason, .. } => {
                self.failed.insert(result.path.clone(), reason.clone());
            }
        }
    }

    pub fn extend<'a>(&mut self, results: impl IntoIterator<Item = &'a DownloadResult>) {
        for r in results {
            self.record(r);
        }
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_succeeded(&self, path: &str) -> bool {
        self.updated.contains(path) || self.cached.contains(path)
    }

    pub fn attempted(&self) -> usize {
        self.updated.len() + self.cached.len() + self.failed.len()
    }

    pub fn failure_ratio(&self) -> f64 {
        match self.attempted() {
            0 => 0.0,
            n => self.failed.len() as f64 / n as f64,
        }
    }

    /// A failure rate this high usually means the mirror and the manifest disagree.
    pub fn stale_mirror_suspected(&self, threshold: f64) -> bool {
        !self.failed.is_empty() && self.failure_ratio() >= threshold
    }

    pub fn hash_mismatches(&self) -> usize {
        self.failed
            .values()
            .filter(|r| matches!(r, FailureReason::HashMismatch { .. }))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub built: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub failed: BTreeMap<String, String>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(path: &str, bytes: u64) -> DownloadResult {
        DownloadResult {
            path: path.into(),
            outcome: DownloadOutcome::Success {
                destination: path.into(),
                bytes,
                mirror: Some("r2eu".into()),
                cached: false,
                verified: true,
            },
        }
    }

    fn failure(path: &str) -> DownloadResult {
        DownloadResult {
            path: path.into(),
            outcome: DownloadOutcome::Failed {
                reason: FailureReason::HttpStatus { status: 503 },
                attempts: 3,
            },
        }
    }

    #[test]
    fn completion_order_does_not_change_the_report() {
        let results = vec![
            success("patch-8/a.lua", 10),
            failure("patch-8/b.lua"),
            success("client/WoW.exe", 32),
            success("patch-9/c.blp", 7),
        ];

        let mut forward = RunReport::default();
        forward.extend(&results);

        let mut backward = RunReport::default();
        backward.extend(results.iter().rev());

        assert_eq!(forward, backward);
        assert_eq!(forward.updated_count(), 3);
        assert_eq!(forward.failed_count(), 1);
        assert_eq!(forward.bytes_downloaded, 49);
    }

    #[test]
    fn stale_mirror_is_suspected_above_threshold() {
        let mut report = RunReport::default();
        report.extend(&[failure("a"), failure("b"), success("c", 1)]);
        assert!(report.stale_mirror_suspected(0.5));
        assert!(!report.stale_mirror_suspected(0.9));
        assert!(!RunReport::default().stale_mirror_suspected(0.0));
    }
}
