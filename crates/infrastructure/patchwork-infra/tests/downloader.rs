use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use camino::Utf8PathBuf;
use patchwork_infra::hashing::hash_bytes;
use patchwork_infra::net::{
    DownloadRequest, Downloader, FetchError, MirrorUrl, RetryPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const GOOD: &[u8] = b"fresh interface file";
const LARGE_LEN: usize = 96 * 1024;

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_jitter: Duration::ZERO,
    }
}

/// `/good` serves GOOD, `/corrupt` serves other bytes, `/missing` 404s and
/// `/flaky` fails with 503 twice before serving GOOD. `/large` serves
/// LARGE_LEN bytes.
async fn start_cdn() -> (String, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let flaky_hits = Arc::new(AtomicUsize::new(0));
    let corrupt_hits = Arc::new(AtomicUsize::new(0));
    let flaky = flaky_hits.clone();
    let corrupt = corrupt_hits.clone();

    let app = Router::new()
        .route("/good", get(|| async { GOOD.to_vec() }))
        .route(
            "/corrupt",
            get(move || {
                let corrupt = corrupt.clone();
                async move {
                    corrupt.fetch_add(1, Ordering::SeqCst);
                    b"stale mirror content".to_vec()
                }
            }),
        )
        .route(
            "/flaky",
            get(move || {
                let flaky = flaky.clone();
                async move {
                    if flaky.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        GOOD.to_vec().into_response()
                    }
                }
            }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route("/large", get(|| async { vec![7u8; LARGE_LEN] }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), flaky_hits, corrupt_hits)
}

fn request(target: Utf8PathBuf, urls: Vec<(&str, String)>, verify: bool) -> DownloadRequest {
    DownloadRequest {
        id: 1,
        urls: urls
            .into_iter()
            .map(|(mirror, url)| MirrorUrl {
                mirror: mirror.into(),
                url,
            })
            .collect(),
        target_path: target,
        expected_size: GOOD.len() as u64,
        expected_hash: verify.then(|| hash_bytes(GOOD)),
    }
}

fn utf8_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().into()).unwrap()
}

fn leftover_temp_files(dir: &Utf8PathBuf) -> usize {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let (base, flaky_hits, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("patch-8/Interface/a.lua");

    let downloader =
        Downloader::new(reqwest::Client::new(), 4, None).with_retry_policy(fast_retries());
    let results = downloader
        .download_batch(
            vec![request(target.clone(), vec![("r2eu", format!("{base}/flaky"))], true)],
            None,
        )
        .await;

    let fetched = results[0].outcome.as_ref().expect("download succeeds");
    assert_eq!(results[0].attempts, 3);
    assert_eq!(flaky_hits.load(Ordering::SeqCst), 3);
    assert!(fetched.verified && !fetched.cached);
    assert_eq!(fetched.mirror.as_deref(), Some("r2eu"));
    assert_eq!(std::fs::read(&target).unwrap(), GOOD);
}

#[tokio::test]
async fn corrupted_download_is_bounded_and_leaves_nothing_behind() {
    let (base, _, corrupt_hits) = start_cdn().await;
    let dir = tempdir().unwrap();
    let stage = utf8_root(&dir).join("patch-8");
    let target = stage.join("a.lua");

    let downloader =
        Downloader::new(reqwest::Client::new(), 4, None).with_retry_policy(fast_retries());
    let results = downloader
        .download_batch(
            vec![request(target.clone(), vec![("r2eu", format!("{base}/corrupt"))], true)],
            None,
        )
        .await;

    match &results[0].outcome {
        Err(FetchError::HashMismatch { expected, actual }) => {
            assert_eq!(expected, &hash_bytes(GOOD));
            assert_eq!(actual, &hash_bytes(b"stale mirror content"));
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
    assert_eq!(results[0].attempts, 3);
    assert_eq!(corrupt_hits.load(Ordering::SeqCst), 3);
    assert!(!target.exists());
    assert_eq!(leftover_temp_files(&stage), 0);
}

#[tokio::test]
async fn falls_over_to_the_next_mirror() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("client/WoW.exe");

    let downloader =
        Downloader::new(reqwest::Client::new(), 1, None).with_retry_policy(fast_retries());
    let results = downloader
        .download_batch(
            vec![request(
                target.clone(),
                vec![
                    ("r2eu", format!("{base}/missing")),
                    ("bunny", format!("{base}/good")),
                ],
                true,
            )],
            None,
        )
        .await;

    let fetched = results[0].outcome.as_ref().unwrap();
    assert_eq!(fetched.mirror.as_deref(), Some("bunny"));
    assert_eq!(results[0].attempts, 4);
}

#[tokio::test]
async fn exhausted_mirrors_report_the_last_status() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("client/gone.dll");

    let downloader =
        Downloader::new(reqwest::Client::new(), 1, None).with_retry_policy(fast_retries());
    let results = downloader
        .download_batch(
            vec![request(target.clone(), vec![("r2eu", format!("{base}/missing"))], true)],
            None,
        )
        .await;

    assert!(matches!(
        results[0].outcome,
        Err(FetchError::Status { status: 404, .. })
    ));
    assert!(!target.exists());
}

#[tokio::test]
async fn redownloading_is_idempotent_and_served_from_cache() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("patch-9/b.lua");
    let req = request(target.clone(), vec![("r2eu", format!("{base}/good"))], true);

    let downloader =
        Downloader::new(reqwest::Client::new(), 2, None).with_retry_policy(fast_retries());
    let first = downloader.download_batch(vec![req.clone()], None).await;
    let first_hash = patchwork_infra::hash_file(&target).unwrap();

    let second = downloader.download_batch(vec![req], None).await;
    let second_hash = patchwork_infra::hash_file(&target).unwrap();

    assert!(!first[0].outcome.as_ref().unwrap().cached);
    let again = second[0].outcome.as_ref().unwrap();
    assert!(again.cached);
    assert_eq!(again.bytes, 0);
    assert_eq!(second[0].attempts, 0);
    assert_eq!(first_hash, second_hash);
}

#[tokio::test]
async fn unverified_downloads_are_flagged() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("patch-8/c.lua");

    let downloader =
        Downloader::new(reqwest::Client::new(), 1, None).with_retry_policy(fast_retries());
    let results = downloader
        .download_batch(
            vec![request(target.clone(), vec![("r2eu", format!("{base}/corrupt"))], false)],
            None,
        )
        .await;

    let fetched = results[0].outcome.as_ref().unwrap();
    assert!(!fetched.verified);
    assert_eq!(std::fs::read(&target).unwrap(), b"stale mirror content");
}

#[tokio::test]
async fn cancelled_batch_writes_nothing() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let target = utf8_root(&dir).join("patch-8/d.lua");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let downloader = Downloader::new(reqwest::Client::new(), 1, None)
        .with_retry_policy(fast_retries())
        .with_cancellation(cancel);
    let results = downloader
        .download_batch(
            vec![request(target.clone(), vec![("r2eu", format!("{base}/good"))], true)],
            None,
        )
        .await;

    assert_eq!(results[0].outcome, Err(FetchError::Cancelled));
    assert!(!target.exists());
}

#[tokio::test]
async fn rate_limit_holds_for_chunks_above_the_quota() {
    let (base, _, _) = start_cdn().await;
    let dir = tempdir().unwrap();
    let root = utf8_root(&dir);
    let target = root.join("patch-8/large.blp");

    let mut req = request(target.clone(), vec![("r2eu", format!("{base}/large"))], true);
    req.expected_size = LARGE_LEN as u64;
    req.expected_hash = Some(hash_bytes(&vec![7u8; LARGE_LEN]));

    // The first second's quota is granted at once; the other 64 KiB take ~2 s.
    let started = std::time::Instant::now();
    let results = Downloader::new(reqwest::Client::new(), 1, Some(32 * 1024))
        .with_retry_policy(fast_retries())
        .download_batch(vec![req], None)
        .await;

    assert!(results[0].outcome.is_ok());
    assert!(
        started.elapsed() >= Duration::from_millis(1800),
        "finished in {:?}",
        started.elapsed()
    );
    assert_eq!(std::fs::metadata(&target).unwrap().len(), LARGE_LEN as u64);
}
