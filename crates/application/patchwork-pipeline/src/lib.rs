mod io_utils;

pub mod build;
pub mod engine;
pub mod execute;
pub mod remote;
pub mod tracker;

pub use build::{BuildCoordinator, BuildState};
pub use engine::{
    CheckOutcome, CleanReport, DownloadOptions, DownloadPlan, EngineConfig, PatchEngine,
};
pub use execute::TaskExecutor;
pub use remote::{HttpManifestSource, ManifestSource, StaticManifestSource};
pub use tracker::{ProgressTracker, TransferSnapshot};

// Re-export scanner types often needed by consumers
pub use patchwork_scanner::ScanStats;

/// High-level error type for pipeline operations.
///
/// Only run-level problems surface here. Individual file and archive failures
/// are recorded in `RunReport` / `BuildReport` instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Manifest unavailable from {}: {last}", .attempted.join(", "))]
    ManifestUnavailable { attempted: Vec<String>, last: String },
    #[error("Manifest rejected: {0}")]
    Manifest(#[from] patchwork_core::ManifestError),
    #[error("Local scan failed: {0}")]
    Scan(#[from] patchwork_scanner::ScannerError),
    #[error("Build state error: {0}")]
    State(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Background task failed: {0}")]
    Task(String),
    #[error("Cancelled")]
    Cancelled,
}
