mod platform;
mod reader;

pub use platform::PathStyle;
pub use reader::{ArchiveReader, CommandArchiveReader};

use camino::{Utf8Path, Utf8PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

const ARCHIVE_PLACEHOLDER: &str = "{archive}";
const SOURCE_PLACEHOLDER: &str = "{source}";
const FILE_PLACEHOLDER: &str = "{file}";
const MEMBER_PLACEHOLDER: &str = "{member}";
const DIR_PLACEHOLDER: &str = "{dir}";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveBuildError {
    #[error("staged file missing: {0}")]
    MissingSource(Utf8PathBuf),
    #[error("invalid archive command template: {0}")]
    Template(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive tool failed for {archive} (exit {status:?}): {stderr}")]
    ToolFailed {
        archive: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInput {
    pub source: Utf8PathBuf,
    /// Backslash-separated name inside the archive.
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub archive: String,
    pub output_path: Utf8PathBuf,
    /// Staging directory holding this archive's members.
    pub source_dir: Utf8PathBuf,
    pub files: Vec<ArchiveInput>,
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveApplied {
    pub archive: String,
    pub files_written: usize,
}

/// Find `file_name` inside `dir`, ignoring ASCII case (`PATCH-8.MPQ` matches
/// `patch-8.mpq`). Exact matches win.
pub fn find_installed(dir: &Utf8Path, file_name: &str) -> Option<Utf8PathBuf> {
    let exact = dir.join(file_name);
    if exact.is_file() {
        return Some(exact);
    }
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .find(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(file_name))
                && e.path().is_file()
        })
        .and_then(|e| Utf8PathBuf::from_path_buf(e.path()).ok())
}

/// Writes staged files into an output archive. Implementations block and are
/// driven from `spawn_blocking`, one call per archive at a time.
pub trait ArchiveBuilder: Send + Sync {
    fn apply(&self, request: &ArchiveRequest) -> Result<ArchiveApplied, ArchiveBuildError>;
}

/// Runs an external archive tool from command templates.
///
/// When the template mentions `{file}` the tool runs once per staged file with
/// `{file}` and `{member}` bound; otherwise it runs once per archive with
/// `{archive}` and `{source}`. Placeholders are substituted after the template
/// is split, so paths containing spaces stay a single argument.
#[derive(Debug, Clone)]
pub struct CommandArchiveBuilder {
    template: String,
    create_template: Option<String>,
    path_style: PathStyle,
}

impl CommandArchiveBuilder {
    pub fn new(template: impl Into<String>) -> Self {
        let template = template.into();
        Self {
            path_style: PathStyle::for_template(&template),
            template,
            create_template: None,
        }
    }

    /// Command run first when the output archive doesn't exist yet.
    pub fn with_create_template(mut self, template: Option<String>) -> Self {
        self.create_template = template;
        self
    }

    fn tool_path(&self, path: &Utf8Path) -> String {
        self.path_style.to_tool_path(path).into_owned()
    }
}

/// Split `template` into program and arguments, then substitute `vars` in
/// each argument.
pub(crate) fn resolve_template(
    template: &str,
    vars: &[(&str, String)],
) -> Result<(String, Vec<String>), ArchiveBuildError> {
    #[cfg(target_os = "windows")]
    let parts = split_command_windows(template);
    #[cfg(not(target_os = "windows"))]
    let parts = shlex::split(template);

    let mut parts =
        parts.ok_or_else(|| ArchiveBuildError::Template(format!("unbalanced quotes: {template}")))?;

    for part in &mut parts {
        for (key, value) in vars {
            if part.contains(key) {
                *part = part.replace(key, value);
            }
        }
    }

    if parts.is_empty() {
        return Err(ArchiveBuildError::Template(
            "command template produced an empty command".into(),
        ));
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Run one resolved tool invocation; a non-zero exit becomes `ToolFailed`.
pub(crate) fn run_tool(
    archive: &str,
    template: &str,
    vars: &[(&str, String)],
) -> Result<(), ArchiveBuildError> {
    let (program, args) = resolve_template(template, vars)?;
    debug!("Running archive tool: {:?} {:?}", program, args);

    let output = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ArchiveBuildError::Spawn {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ArchiveBuildError::ToolFailed {
            archive: archive.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl ArchiveBuilder for CommandArchiveBuilder {
    fn apply(&self, request: &ArchiveRequest) -> Result<ArchiveApplied, ArchiveBuildError> {
        if let Some(missing) = request.files.iter().find(|f| !f.source.is_file()) {
            return Err(ArchiveBuildError::MissingSource(missing.source.clone()));
        }

        let archive_arg = self.tool_path(&request.output_path);
        let source_arg = self.tool_path(&request.source_dir);

        if !request.output_path.exists() {
            if let Some(create) = &self.create_template {
                info!("Creating {}", request.output_path);
                run_tool(
                    &request.archive,
                    create,
                    &[(ARCHIVE_PLACEHOLDER, archive_arg.clone())],
                )?;
            }
        }

        if self.template.contains(FILE_PLACEHOLDER) {
            for file in &request.files {
                run_tool(
                    &request.archive,
                    &self.template,
                    &[
                        (ARCHIVE_PLACEHOLDER, archive_arg.clone()),
                        (SOURCE_PLACEHOLDER, source_arg.clone()),
                        (FILE_PLACEHOLDER, self.tool_path(&file.source)),
                        (MEMBER_PLACEHOLDER, file.member.clone()),
                    ],
                )?;
            }
        } else {
            run_tool(
                &request.archive,
                &self.template,
                &[
                    (ARCHIVE_PLACEHOLDER, archive_arg),
                    (SOURCE_PLACEHOLDER, source_arg),
                ],
            )?;
        }

        Ok(ArchiveApplied {
            archive: request.archive.clone(),
            files_written: request.files.len(),
        })
    }
}

#[cfg(target_os = "windows")]
fn split_command_windows(cmd: &str) -> Option<Vec<String>> {
    // POSIX shlex would eat the backslashes in `C:\Tools\MPQEditor.exe`;
    // plain double-quote grouping is enough here.
    let mut parts = Vec::<String>::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in cmd.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if in_quotes {
        return None;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_with_spaces_stay_one_argument() {
        let builder = CommandArchiveBuilder::new("mpqtool add {archive} {file} {member}");
        let (program, args) = resolve_template(
            &builder.template,
            &[
                (ARCHIVE_PLACEHOLDER, "/out dir/patch-8.mpq".into()),
                (FILE_PLACEHOLDER, "/stage/patch-8/Interface/a b.lua".into()),
                (MEMBER_PLACEHOLDER, "Interface\\a b.lua".into()),
            ],
        )
        .expect("template resolves");

        assert_eq!(program, "mpqtool");
        assert_eq!(
            args,
            vec![
                "add",
                "/out dir/patch-8.mpq",
                "/stage/patch-8/Interface/a b.lua",
                "Interface\\a b.lua"
            ]
        );
    }

    #[test]
    fn wine_templates_translate_paths() {
        let builder = CommandArchiveBuilder::new("wine MPQEditor.exe /add {archive} {file}");
        assert_eq!(builder.path_style, PathStyle::Wine);
        assert_eq!(
            builder.tool_path(Utf8Path::new("/tmp/out/patch-8.mpq")),
            r"Z:\tmp\out\patch-8.mpq"
        );
        assert_eq!(
            CommandArchiveBuilder::new("mpqcli add {archive}").path_style,
            PathStyle::Native
        );
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn unbalanced_quotes_are_rejected() {
        let builder = CommandArchiveBuilder::new("tool \"{archive}");
        assert!(matches!(
            resolve_template(&builder.template, &[]),
            Err(ArchiveBuildError::Template(_))
        ));
    }
}
