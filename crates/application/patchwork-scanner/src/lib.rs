use camino::{Utf8Path, Utf8PathBuf};
use patchwork_core::diff::LocalStateSource;
use patchwork_core::path_utils::PatchPath;
use patchwork_core::{LocalFileState, ManifestEntry, ARCHIVE_EXTENSION};
use patchwork_infra::archive::{find_installed, ArchiveReader};
use patchwork_infra::hashing::{hash_bytes, hash_file};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Scan cancelled")]
    Cancelled,
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanStats {
    pub files_scanned: u64,
    /// Files whose size matched and were therefore hashed.
    pub files_hashed: u64,
    pub total_files: u64,
    pub bytes_hashed: u64,
    pub total_bytes: u64,
}

pub type ProgressCb = Box<dyn Fn(ScanStats) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Installed archives and the tool that reads members out of them.
struct InstalledArchives {
    data_dir: Utf8PathBuf,
    reader: Arc<dyn ArchiveReader>,
    located: Mutex<HashMap<String, Option<Utf8PathBuf>>>,
}

impl InstalledArchives {
    fn locate(&self, archive: &str) -> Option<Utf8PathBuf> {
        if let Some(hit) = lock(&self.located).get(archive) {
            return hit.clone();
        }
        let file_name = format!("{archive}.{ARCHIVE_EXTENSION}");
        let found = find_installed(&self.data_dir, &file_name);
        lock(&self.located)
            .entry(archive.to_string())
            .or_insert(found)
            .clone()
    }

    /// Stop reading from `archive` for the rest of the run.
    fn disable(&self, archive: &str) {
        lock(&self.located).insert(archive.to_string(), None);
    }
}

/// Fingerprints local files against manifest entries.
///
/// Client files are looked up under the game directory. Archive members are
/// looked up as their staged copies under the download directory and, when an
/// archive reader is configured, inside the game's installed archive: a
/// staged copy that matches wins, otherwise the installed member is reported,
/// otherwise the staged state. Every result is memoized for the lifetime of
/// the scanner, so a file is hashed at most once per run no matter how often
/// it is asked for.
pub struct LocalScanner {
    game_dir: Utf8PathBuf,
    download_dir: Utf8PathBuf,
    installed: Option<InstalledArchives>,
    memo: Mutex<HashMap<String, LocalFileState>>,
    staged: Mutex<HashMap<String, LocalFileState>>,
    stats: Mutex<ScanStats>,
}

impl LocalScanner {
    pub fn new(game_dir: impl Into<Utf8PathBuf>, download_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            game_dir: game_dir.into(),
            download_dir: download_dir.into(),
            installed: None,
            memo: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
            stats: Mutex::new(ScanStats::default()),
        }
    }

    /// Also read members from `<data_dir>/<archive>.mpq`.
    pub fn with_installed_archives(
        mut self,
        data_dir: impl Into<Utf8PathBuf>,
        reader: Arc<dyn ArchiveReader>,
    ) -> Self {
        self.installed = Some(InstalledArchives {
            data_dir: data_dir.into(),
            reader,
            located: Mutex::new(HashMap::new()),
        });
        self
    }

    pub fn game_dir(&self) -> &Utf8Path {
        &self.game_dir
    }

    pub fn download_dir(&self) -> &Utf8Path {
        &self.download_dir
    }

    /// On-disk file compared against `entry`: the game copy of a client file,
    /// the staged copy of a member.
    pub fn resolve(&self, entry: &ManifestEntry) -> Utf8PathBuf {
        match entry.archive {
            None => self.game_dir.join(&entry.name),
            Some(_) => self.download_dir.join(&entry.path),
        }
    }

    pub fn stats(&self) -> ScanStats {
        lock(&self.stats).clone()
    }

    pub fn fingerprint(&self, entry: &ManifestEntry) -> LocalFileState {
        if let Some(hit) = lock(&self.memo).get(&entry.path) {
            return hit.clone();
        }

        let state = match entry.archive {
            None => self.file_state(entry, &self.resolve(entry)),
            Some(_) => self.member_state(entry),
        };
        lock(&self.memo)
            .entry(entry.path.clone())
            .or_insert(state)
            .clone()
    }

    fn member_state(&self, entry: &ManifestEntry) -> LocalFileState {
        let staged = self.staged_state(entry);
        if matches_entry(entry, &staged) {
            return staged;
        }
        match self.installed_state(entry) {
            Some(installed) if installed.exists => installed,
            _ => staged,
        }
    }

    /// Fingerprint of the staged copy alone, memoized separately.
    fn staged_state(&self, entry: &ManifestEntry) -> LocalFileState {
        if let Some(hit) = lock(&self.staged).get(&entry.path) {
            return hit.clone();
        }
        let state = self.file_state(entry, &self.resolve(entry));
        lock(&self.staged)
            .entry(entry.path.clone())
            .or_insert(state)
            .clone()
    }

    /// `None` when no reader is configured, the archive isn't installed or
    /// the tool failed.
    fn installed_state(&self, entry: &ManifestEntry) -> Option<LocalFileState> {
        let installed = self.installed.as_ref()?;
        let group = entry.archive.as_deref()?;
        let archive = installed.locate(group)?;

        let data = match installed.reader.read_member(&archive, &entry.member_name()) {
            Ok(Some(data)) => data,
            Ok(None) => return Some(LocalFileState::absent(&entry.path)),
            Err(e) => {
                warn!("Cannot read {}, using staged files only: {}", archive, e);
                installed.disable(group);
                return None;
            }
        };

        let size = data.len() as u64;
        let hash = (size == entry.size).then(|| hash_bytes(&data));
        {
            let mut stats = lock(&self.stats);
            stats.files_scanned += 1;
            if hash.is_some() {
                stats.files_hashed += 1;
                stats.bytes_hashed += size;
            }
        }
        Some(LocalFileState {
            path: entry.path.clone(),
            exists: true,
            size: Some(size),
            hash,
            unreadable: None,
        })
    }

    fn file_state(&self, entry: &ManifestEntry, path: &Utf8Path) -> LocalFileState {
        let meta = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return LocalFileState::absent(&entry.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return LocalFileState::absent(&entry.path)
            }
            Err(e) => {
                warn!("Cannot stat {}: {}", path, e);
                return LocalFileState::unreadable(&entry.path, e.to_string());
            }
        };

        let size = meta.len();
        let mut state = LocalFileState {
            path: entry.path.clone(),
            exists: true,
            size: Some(size),
            hash: None,
            unreadable: None,
        };

        {
            let mut stats = lock(&self.stats);
            stats.files_scanned += 1;
        }

        // A size mismatch already decides the outcome.
        if size != entry.size {
            debug!("{}: size {} != expected {}", entry.path, size, entry.size);
            return state;
        }

        match hash_file(path) {
            Ok(digest) => {
                let mut stats = lock(&self.stats);
                stats.files_hashed += 1;
                stats.bytes_hashed += digest.size;
                state.hash = Some(digest.hash);
                state
            }
            Err(e) => {
                warn!("Cannot hash {}: {}", path, e);
                LocalFileState::unreadable(&entry.path, e.to_string())
            }
        }
    }

    /// Fingerprint `entries` on the rayon pool ahead of a diff.
    ///
    /// Progress is reported from a background thread every 100 ms and once
    /// more when the scan finishes.
    pub fn prefetch(
        &self,
        entries: &[ManifestEntry],
        on_progress: Option<ProgressCb>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<ScanStats, ScannerError> {
        info!(
            "Scanning {} files ({} / {})",
            entries.len(),
            self.game_dir,
            self.download_dir
        );

        {
            let mut stats = lock(&self.stats);
            stats.total_files += entries.len() as u64;
            stats.total_bytes += entries.iter().map(|e| e.size).sum::<u64>();
        }

        let progress_cb = on_progress.map(Arc::new);
        let done = Arc::new(AtomicBool::new(false));

        let result = thread::scope(|scope| {
            if let Some(cb) = progress_cb.clone() {
                let done = done.clone();
                scope.spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        (cb)(self.stats());
                        thread::sleep(Duration::from_millis(100));
                    }
                });
            }

            let res = entries.par_iter().try_for_each(|entry| {
                if cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(ScannerError::Cancelled);
                }
                self.fingerprint(entry);
                Ok(())
            });
            done.store(true, Ordering::Relaxed);
            res
        });

        if let Some(cb) = progress_cb {
            (cb)(self.stats());
        }

        result.map(|_| self.stats())
    }

    /// Forget memoized results for `paths`, e.g. after they were re-downloaded.
    pub fn invalidate<'a>(&self, paths: impl IntoIterator<Item = &'a String>) {
        let mut memo = lock(&self.memo);
        let mut staged = lock(&self.staged);
        for p in paths {
            memo.remove(p);
            staged.remove(p);
        }
    }

    /// Whether `entry` is an archive member whose staged copy matches its hash.
    pub fn is_staged(&self, entry: &ManifestEntry) -> bool {
        entry.archive.is_some() && matches_entry(entry, &self.staged_state(entry))
    }

    /// Files present under an archive's staging directory, relative to it and
    /// `/`-separated.
    pub fn staged_files(&self, archive: &str) -> Result<Vec<String>, ScannerError> {
        let root = self.download_dir.join(archive);
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            match rel.to_str() {
                Some(rel) => files.push(PatchPath::normalize(rel)),
                None => warn!("Skipping non UTF-8 path {}", entry.path().display()),
            }
        }
        files.sort();
        Ok(files)
    }
}

fn matches_entry(entry: &ManifestEntry, state: &LocalFileState) -> bool {
    state.hash.as_deref().is_some_and(|h| entry.hash_matches(h))
}

impl LocalStateSource for LocalScanner {
    fn state(&self, entry: &ManifestEntry) -> LocalFileState {
        self.fingerprint(entry)
    }
}
