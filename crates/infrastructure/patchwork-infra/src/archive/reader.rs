use super::{
    run_tool, ArchiveBuildError, PathStyle, ARCHIVE_PLACEHOLDER, DIR_PLACEHOLDER,
    FILE_PLACEHOLDER, MEMBER_PLACEHOLDER,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tracing::debug;

/// Reads single members out of an installed archive. Blocking; the scanner
/// calls it from its rayon pool.
pub trait ArchiveReader: Send + Sync {
    /// Content of `member` (backslash separated), or `None` when the archive
    /// does not hold it.
    fn read_member(
        &self,
        archive: &Utf8Path,
        member: &str,
    ) -> Result<Option<Vec<u8>>, ArchiveBuildError>;
}

/// Extracts members with an external tool into a scratch directory.
///
/// The template gets `{archive}` and `{member}`, plus `{file}` (the exact
/// path to write) and `{dir}` (a fresh directory). Tools that only accept an
/// output directory may write anywhere below `{dir}`; the single file found
/// there is taken as the member. A successful run that writes nothing means
/// the member is absent.
#[derive(Debug, Clone)]
pub struct CommandArchiveReader {
    template: String,
    path_style: PathStyle,
}

impl CommandArchiveReader {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            path_style: PathStyle::for_template(&template),
            template,
        }
    }
}

fn first_file(dir: &Utf8Path) -> Option<Utf8PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file())
        .and_then(|e| Utf8PathBuf::from_path_buf(e.into_path()).ok())
}

impl ArchiveReader for CommandArchiveReader {
    fn read_member(
        &self,
        archive: &Utf8Path,
        member: &str,
    ) -> Result<Option<Vec<u8>>, ArchiveBuildError> {
        let scratch = tempfile::Builder::new()
            .prefix(".patchwork-extract-")
            .tempdir()?;
        let dir = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| ArchiveBuildError::Template("scratch path is not UTF-8".into()))?
            .to_owned();
        let out_dir = dir.join("out");
        fs::create_dir_all(&out_dir)?;
        let file = dir.join("member");

        let label = archive.file_name().unwrap_or(archive.as_str());
        run_tool(
            label,
            &self.template,
            &[
                (ARCHIVE_PLACEHOLDER, self.path_style.to_tool_path(archive).into_owned()),
                (MEMBER_PLACEHOLDER, member.to_string()),
                (FILE_PLACEHOLDER, self.path_style.to_tool_path(&file).into_owned()),
                (DIR_PLACEHOLDER, self.path_style.to_tool_path(&out_dir).into_owned()),
            ],
        )?;

        let written = if file.is_file() {
            Some(file)
        } else {
            first_file(&out_dir)
        };
        match written {
            Some(path) => Ok(Some(fs::read(&path)?)),
            None => {
                debug!("{} holds no {}", archive, member);
                Ok(None)
            }
        }
    }
}
