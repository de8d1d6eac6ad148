#![cfg(unix)]

use camino::Utf8PathBuf;
use patchwork_infra::archive::{
    ArchiveBuildError, ArchiveBuilder, ArchiveInput, ArchiveReader, ArchiveRequest,
    CommandArchiveBuilder, CommandArchiveReader,
};
use tempfile::tempdir;

fn staged_request(root: &Utf8PathBuf) -> ArchiveRequest {
    let source_dir = root.join("stage/patch-8");
    std::fs::create_dir_all(source_dir.join("Interface")).unwrap();
    std::fs::write(source_dir.join("Interface/a.lua"), "a").unwrap();
    std::fs::write(source_dir.join("Interface/b c.lua"), "bc").unwrap();

    ArchiveRequest {
        archive: "patch-8".into(),
        output_path: root.join("out/patch-8.mpq"),
        source_dir: source_dir.clone(),
        files: vec![
            ArchiveInput {
                source: source_dir.join("Interface/a.lua"),
                member: "Interface\\a.lua".into(),
            },
            ArchiveInput {
                source: source_dir.join("Interface/b c.lua"),
                member: "Interface\\b c.lua".into(),
            },
        ],
        force_rebuild: false,
    }
}

#[test]
fn per_file_template_runs_once_per_member() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let request = staged_request(&root);
    std::fs::create_dir_all(root.join("out")).unwrap();

    // Appends "<member>=<content>" lines to the archive stand-in.
    let builder = CommandArchiveBuilder::new(
        r#"sh -c 'printf "%s=%s\n" "$2" "$(cat "$1")" >> "$0"' {archive} {file} {member}"#,
    )
    .with_create_template(Some("touch {archive}".into()));

    let applied = builder.apply(&request).unwrap();
    assert_eq!(applied.files_written, 2);

    let written = std::fs::read_to_string(&request.output_path).unwrap();
    assert_eq!(written, "Interface\\a.lua=a\nInterface\\b c.lua=bc\n");
}

#[test]
fn directory_template_runs_once() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let request = staged_request(&root);
    std::fs::create_dir_all(root.join("out")).unwrap();

    let builder = CommandArchiveBuilder::new(r#"sh -c 'ls "$1" > "$0"' {archive} {source}"#);
    builder.apply(&request).unwrap();

    let listing = std::fs::read_to_string(&request.output_path).unwrap();
    assert_eq!(listing.trim(), "Interface");
}

#[test]
fn tool_failure_carries_stderr() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let request = staged_request(&root);

    let builder = CommandArchiveBuilder::new("sh -c 'echo archive is locked >&2; exit 3'");
    match builder.apply(&request) {
        Err(ArchiveBuildError::ToolFailed {
            archive,
            status,
            stderr,
        }) => {
            assert_eq!(archive, "patch-8");
            assert_eq!(status, Some(3));
            assert_eq!(stderr, "archive is locked");
        }
        other => panic!("expected tool failure, got {other:?}"),
    }
}

#[test]
fn missing_staged_file_is_reported_before_running() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let mut request = staged_request(&root);
    request.files.push(ArchiveInput {
        source: root.join("stage/patch-8/gone.lua"),
        member: "gone.lua".into(),
    });

    let builder = CommandArchiveBuilder::new("false");
    assert!(matches!(
        builder.apply(&request),
        Err(ArchiveBuildError::MissingSource(p)) if p.ends_with("gone.lua")
    ));
}

/// A directory stands in for the installed archive; members are plain files.
fn installed_archive(root: &Utf8PathBuf) -> Utf8PathBuf {
    let archive = root.join("Data/patch-8.mpq");
    std::fs::create_dir_all(&archive).unwrap();
    std::fs::write(archive.join("a.lua"), "-- shipped").unwrap();
    archive
}

#[test]
fn reader_returns_member_written_to_file() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let archive = installed_archive(&root);

    let reader = CommandArchiveReader::new(
        r#"sh -c 'if [ -f "$0/$1" ]; then cp "$0/$1" "$2"; fi' {archive} {member} {file}"#,
    );

    assert_eq!(
        reader.read_member(&archive, "a.lua").unwrap().as_deref(),
        Some(&b"-- shipped"[..])
    );
    assert_eq!(reader.read_member(&archive, "gone.lua").unwrap(), None);
}

#[test]
fn reader_picks_up_member_extracted_below_dir() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let archive = installed_archive(&root);

    // Extracts with the full member path, like MPQEditor's /fp.
    let reader = CommandArchiveReader::new(
        r#"sh -c 'mkdir -p "$1/Interface" && cp "$0/a.lua" "$1/Interface/a.lua"' {archive} {dir}"#,
    );

    assert_eq!(
        reader.read_member(&archive, "Interface\\a.lua").unwrap(),
        Some(b"-- shipped".to_vec())
    );
}

#[test]
fn reader_tool_failure_is_an_error() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().into()).unwrap();
    let archive = installed_archive(&root);

    let reader = CommandArchiveReader::new("sh -c 'echo cannot open archive >&2; exit 1'");
    match reader.read_member(&archive, "a.lua") {
        Err(ArchiveBuildError::ToolFailed { archive, stderr, .. }) => {
            assert_eq!(archive, "patch-8.mpq");
            assert_eq!(stderr, "cannot open archive");
        }
        other => panic!("expected tool failure, got {other:?}"),
    }
}
