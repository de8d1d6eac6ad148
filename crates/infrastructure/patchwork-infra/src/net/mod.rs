use crate::hashing::{hash_reader, CHUNK_SIZE};
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, StreamExt};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Client;
use std::io::BufReader;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Byte-rate limit shared by every transfer of a batch.
struct Throttle {
    limiter: Limiter,
    /// Largest amount the limiter grants at once.
    burst: NonZeroU32,
}

impl Throttle {
    fn new(bytes_per_sec: u64) -> Option<Self> {
        let burst = NonZeroU32::new(bytes_per_sec.min(u32::MAX as u64) as u32)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        })
    }

    /// Wait until `bytes` may pass. Chunks larger than the burst are paid for
    /// in burst-sized pieces.
    async fn consume(&self, bytes: usize) {
        let mut left = bytes;
        while left > 0 {
            let piece = left.min(self.burst.get() as usize);
            left -= piece;
            let Some(n) = NonZeroU32::new(piece as u32) else {
                break;
            };
            if let Err(e) = self.limiter.until_n_ready(n).await {
                warn!("Rate limiter refused {} bytes: {}", piece, e);
            }
        }
    }
}

/// Characters escaped inside a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Shared HTTP client with the user agent and timeouts applied.
pub fn default_http_client(
    user_agent: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .build()
}

/// `{base}/{name}` with every segment of `name` percent-encoded.
pub fn mirror_file_url(base_url: &str, name: &str) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();
    for segment in name.split(['/', '\\']).filter(|s| !s.is_empty()) {
        url.push('/');
        url.extend(utf8_percent_encode(segment, PATH_SEGMENT));
    }
    url
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorUrl {
    pub mirror: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: u64,
    /// Candidate sources, tried in order.
    pub urls: Vec<MirrorUrl>,
    pub target_path: Utf8PathBuf,
    pub expected_size: u64,
    /// `None` disables verification.
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per mirror before falling over to the next one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt` plus random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            backoff
        } else {
            backoff + Duration::from_millis(rand::random_range(0..=jitter_ms))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: u64,
    pub mirror: Option<String>,
    /// The target already held matching content.
    pub cached: bool,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("IO error at {path}: {message}")]
    Io { path: Utf8PathBuf, message: String },
    #[error("no mirror URL available")]
    NoMirror,
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    fn io(path: &Utf8Path, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Status { .. } | Self::HashMismatch { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub id: u64,
    pub outcome: Result<Fetched, FetchError>,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum DownloadEvent {
    Started { id: u64, total_bytes: u64 },
    Progress { id: u64, bytes_delta: u64 },
    /// A failed attempt is being retried; `discarded_bytes` were thrown away.
    Retrying {
        id: u64,
        attempt: u32,
        discarded_bytes: u64,
    },
    Completed { id: u64, success: bool },
}

#[derive(Clone)]
struct Worker {
    client: Client,
    tx: Option<Sender<DownloadEvent>>,
    throttle: Option<Arc<Throttle>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Worker {
    async fn emit(&self, event: DownloadEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

pub struct Downloader {
    client: Client,
    concurrency: usize,
    rate_limit_bytes: Option<u64>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(client: Client, concurrency: usize, rate_limit_bytes: Option<u64>) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            rate_limit_bytes,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch every request with at most `concurrency` in flight. Results come
    /// back in completion order.
    pub async fn download_batch(
        &self,
        items: Vec<DownloadRequest>,
        progress_tx: Option<Sender<DownloadEvent>>,
    ) -> Vec<DownloadResult> {
        let throttle = self
            .rate_limit_bytes
            .and_then(Throttle::new)
            .map(Arc::new);
        let worker = Worker {
            client: self.client.clone(),
            tx: progress_tx,
            throttle,
            retry: self.retry,
            cancel: self.cancel.clone(),
        };

        stream::iter(items)
            .map(|item| {
                let worker = worker.clone();
                async move { Self::download_single(worker, item).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    async fn download_single(worker: Worker, req: DownloadRequest) -> DownloadResult {
        worker
            .emit(DownloadEvent::Started {
                id: req.id,
                total_bytes: req.expected_size,
            })
            .await;

        let (outcome, attempts) = Self::run_attempts(&worker, &req).await;

        worker
            .emit(DownloadEvent::Completed {
                id: req.id,
                success: outcome.is_ok(),
            })
            .await;

        DownloadResult {
            id: req.id,
            outcome,
            attempts,
        }
    }

    async fn run_attempts(
        worker: &Worker,
        req: &DownloadRequest,
    ) -> (Result<Fetched, FetchError>, u32) {
        if let Some(parent) = req.target_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return (Err(FetchError::io(parent, e)), 0);
            }
        }

        if let Some(expected) = &req.expected_hash {
            if already_present(&req.target_path, req.expected_size, expected).await {
                debug!("{} already matches, skipping transfer", req.target_path);
                return (
                    Ok(Fetched {
                        bytes: 0,
                        mirror: None,
                        cached: true,
                        verified: true,
                    }),
                    0,
                );
            }
        }

        let per_mirror = worker.retry.max_retries.max(1);
        let mut attempts = 0u32;
        let mut last_err = FetchError::NoMirror;

        'mirrors: for source in &req.urls {
            for attempt in 0..per_mirror {
                if worker.cancel.is_cancelled() {
                    last_err = FetchError::Cancelled;
                    break 'mirrors;
                }
                attempts += 1;

                let mut written = 0u64;
                match Self::fetch_once(worker, req, source, &mut written).await {
                    Ok(fetched) => return (Ok(fetched), attempts),
                    Err(e) => {
                        warn!(
                            "{} from {} failed (attempt {}/{}): {}",
                            req.target_path,
                            source.mirror,
                            attempt + 1,
                            per_mirror,
                            e
                        );
                        let retryable = e.is_retryable();
                        last_err = e;
                        if !retryable {
                            break 'mirrors;
                        }
                        worker
                            .emit(DownloadEvent::Retrying {
                                id: req.id,
                                attempt: attempts,
                                discarded_bytes: written,
                            })
                            .await;
                        if attempt + 1 < per_mirror {
                            let cancelled = tokio::select! {
                                _ = worker.cancel.cancelled() => true,
                                _ = tokio::time::sleep(worker.retry.delay(attempt)) => false,
                            };
                            if cancelled {
                                last_err = FetchError::Cancelled;
                                break 'mirrors;
                            }
                        }
                    }
                }
            }
            debug!("{}: giving up on mirror {}", req.target_path, source.mirror);
        }

        (Err(last_err), attempts)
    }

    /// One transfer into a temporary file beside the target. The temporary
    /// file is removed on every error path when `tmp_path` drops.
    async fn fetch_once(
        worker: &Worker,
        req: &DownloadRequest,
        source: &MirrorUrl,
        written: &mut u64,
    ) -> Result<Fetched, FetchError> {
        let resp = worker
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: source.url.clone(),
            });
        }

        let dir = req
            .target_path
            .parent()
            .unwrap_or_else(|| Utf8Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".patchwork-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| FetchError::io(dir, e))?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut stream = resp.bytes_stream();
        let mut accumulated = 0u64;
        let mut last_emit = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = worker.cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| FetchError::Network(e.to_string()))?;

            if let Some(throttle) = &worker.throttle {
                throttle.consume(chunk.len()).await;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(&req.target_path, e))?;

            let len = chunk.len() as u64;
            *written += len;
            accumulated += len;
            if accumulated > 1_000_000 || last_emit.elapsed().as_millis() > 100 {
                worker
                    .emit(DownloadEvent::Progress {
                        id: req.id,
                        bytes_delta: accumulated,
                    })
                    .await;
                accumulated = 0;
                last_emit = Instant::now();
            }
        }

        if accumulated > 0 {
            worker
                .emit(DownloadEvent::Progress {
                    id: req.id,
                    bytes_delta: accumulated,
                })
                .await;
        }

        file.flush()
            .await
            .map_err(|e| FetchError::io(&req.target_path, e))?;
        drop(file);

        let verified = match &req.expected_hash {
            Some(expected) => {
                let path = tmp_path.to_path_buf();
                let digest = tokio::task::spawn_blocking(move || {
                    std::fs::File::open(&path)
                        .and_then(|f| hash_reader(BufReader::with_capacity(CHUNK_SIZE, f)))
                })
                .await
                .map_err(|e| FetchError::io(&req.target_path, e))?
                .map_err(|e| FetchError::io(&req.target_path, e))?;

                if !digest.matches(expected) {
                    return Err(FetchError::HashMismatch {
                        expected: expected.clone(),
                        actual: digest.hash,
                    });
                }
                true
            }
            None => false,
        };

        tmp_path
            .persist(&req.target_path)
            .map_err(|e| FetchError::io(&req.target_path, e.error))?;

        Ok(Fetched {
            bytes: *written,
            mirror: Some(source.mirror.clone()),
            cached: false,
            verified,
        })
    }
}

async fn already_present(path: &Utf8Path, expected_size: u64, expected_hash: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == expected_size => {}
        _ => return false,
    }
    let owned = path.to_owned();
    let digest = tokio::task::spawn_blocking(move || crate::hashing::hash_file(&owned)).await;
    matches!(digest, Ok(Ok(d)) if d.matches(expected_hash))
}
