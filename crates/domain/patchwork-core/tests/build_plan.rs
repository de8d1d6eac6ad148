use patchwork_core::plan::{plan_archive_builds, ArchiveFile};
use patchwork_core::report::{DownloadOutcome, DownloadResult, RunReport};
use patchwork_core::{Manifest, ManifestEntry};

const H: &str = "AB";

fn manifest() -> Manifest {
    Manifest::from_entries(vec![
        ManifestEntry::new("WoW.exe", H, 1, None),
        ManifestEntry::new("Interface/a.lua", H, 1, Some("patch-8")),
        ManifestEntry::new("Interface/b.lua", H, 1, Some("patch-8")),
        ManifestEntry::new("Sound/x.wav", H, 1, Some("patch-9")),
    ])
    .unwrap()
}

fn downloaded(path: &str) -> DownloadResult {
    DownloadResult {
        path: path.into(),
        outcome: DownloadOutcome::Success {
            destination: path.into(),
            bytes: 1,
            mirror: None,
            cached: false,
            verified: true,
        },
    }
}

#[test]
fn only_archives_with_new_content_are_planned() {
    let mut report = RunReport::default();
    report.extend(&[downloaded("patch-8/Interface/b.lua"), downloaded("client/WoW.exe")]);

    let plans = plan_archive_builds(&manifest(), &report, false, |_| true);

    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].archive, "patch-8");
    assert_eq!(plans[0].file_name(), "patch-8.mpq");
    assert!(!plans[0].force_rebuild);
    assert_eq!(
        plans[0].files,
        vec![ArchiveFile {
            source: "patch-8/Interface/b.lua".into(),
            member: "Interface\\b.lua".into(),
        }]
    );
}

#[test]
fn force_with_no_changes_plans_every_archive() {
    let report = RunReport::default();
    assert_eq!(report.updated_count(), 0);

    let staged = |e: &ManifestEntry| e.path != "patch-8/Interface/a.lua";
    let plans = plan_archive_builds(&manifest(), &report, true, staged);

    let names: Vec<&str> = plans.iter().map(|p| p.archive.as_str()).collect();
    assert_eq!(names, vec!["patch-8", "patch-9"]);
    assert!(plans.iter().all(|p| p.force_rebuild));
    assert_eq!(plans[0].files.len(), 1);
    assert_eq!(plans[1].files[0].member, "Sound\\x.wav");
}

#[test]
fn nothing_is_planned_without_changes_or_force() {
    let plans = plan_archive_builds(&manifest(), &RunReport::default(), false, |_| true);
    assert!(plans.is_empty());
}
