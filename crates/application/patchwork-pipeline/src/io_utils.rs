use camino::Utf8Path;
use std::fs;
use std::io;

/// Copy `from` to `to` through a temporary file beside `to`, so a crash never
/// leaves a half-written file at the destination.
pub fn copy_atomic(from: &Utf8Path, to: &Utf8Path) -> io::Result<u64> {
    let dir = to.parent().unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut src = fs::File::open(from)?;
    let copied = io::copy(&mut src, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(to).map_err(|e| e.error)?;
    Ok(copied)
}

/// Number of regular files below `dir` (0 when it doesn't exist).
pub fn count_files(dir: &Utf8Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}
