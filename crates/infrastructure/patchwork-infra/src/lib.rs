pub mod archive;
pub mod hashing;
pub mod net;

// Re-exports for convenience
pub use archive::{
    ArchiveApplied, ArchiveBuildError, ArchiveBuilder, ArchiveInput, ArchiveReader,
    ArchiveRequest, CommandArchiveBuilder, CommandArchiveReader,
};
pub use hashing::{hash_file, FileDigest, HashError};
pub use net::{
    default_http_client, DownloadEvent, DownloadRequest, DownloadResult, Downloader, FetchError,
    Fetched, MirrorUrl, RetryPolicy,
};
