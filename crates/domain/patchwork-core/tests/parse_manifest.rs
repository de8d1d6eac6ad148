use patchwork_core::formats::parse_manifest;
use patchwork_core::ManifestError;

const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

#[test]
fn parses_client_and_patch_files_in_order() {
    let json = format!(
        r#"{{
  "client": [
    {{ "name": "WoW.exe", "type": "file", "hash": "{HASH}", "size": 4,
       "mirrors": {{ "r2eu": "https://cdn.example/WoW.exe" }} }},
    {{ "name": "Data", "type": "dir" }},
    {{ "name": "Data\\patch-3.mpq", "type": "file", "hash": "{HASH}", "size": 10 }}
  ],
  "patches": [
    {{ "key": "8", "files": [
      {{ "name": "Interface\\FrameXML\\UIParent.lua", "type": "file", "hash": "{HASH}", "size": 4 }}
    ] }},
    {{ "key": 9, "files": [
      {{ "name": "Sound", "type": "dir" }},
      {{ "name": "Sound/x.wav", "type": "file", "hash": "{HASH}", "size": 4 }}
    ] }},
    {{ "key": "Z", "files": [] }}
  ]
}}"#
    );

    let manifest = parse_manifest(json.as_bytes()).unwrap();
    let paths: Vec<&str> = manifest.entries().iter().map(|e| e.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "client/WoW.exe",
            "client/Data/patch-3.mpq",
            "patch-8/Interface/FrameXML/UIParent.lua",
            "patch-9/Sound/x.wav",
        ]
    );

    let exe = manifest.get("client/WoW.exe").unwrap();
    assert_eq!(exe.hash, HASH.to_uppercase());
    assert_eq!(exe.archive, None);
    assert_eq!(exe.mirrors["r2eu"], "https://cdn.example/WoW.exe");
    assert!(manifest.get("client/Data/patch-3.mpq").unwrap().is_container());

    let lua = manifest
        .get("patch-8/interface/framexml/uiparent.lua")
        .expect("lookups are case-insensitive");
    assert_eq!(lua.archive.as_deref(), Some("patch-8"));
    assert_eq!(lua.member_name(), "Interface\\FrameXML\\UIParent.lua");

    let archives: Vec<&str> = manifest.archives().into_iter().collect();
    assert_eq!(archives, vec!["patch-8", "patch-9"]);
}

#[test]
fn duplicate_paths_are_an_integrity_error() {
    let json = format!(
        r#"{{ "patches": [ {{ "key": "8", "files": [
            {{ "name": "Interface/a.lua", "type": "file", "hash": "{HASH}", "size": 1 }},
            {{ "name": "interface\\A.lua", "type": "file", "hash": "{HASH}", "size": 1 }}
        ] }} ] }}"#
    );

    let err = parse_manifest(json.as_bytes()).unwrap_err();
    assert!(matches!(err, ManifestError::DuplicatePath(_)), "got {err:?}");
}

#[test]
fn file_without_hash_or_size_is_rejected() {
    let no_hash = r#"{ "client": [ { "name": "WoW.exe", "type": "file", "size": 1 } ] }"#;
    match parse_manifest(no_hash.as_bytes()) {
        Err(ManifestError::MissingField { path, field }) => {
            assert_eq!(path, "client/WoW.exe");
            assert_eq!(field, "hash");
        }
        other => panic!("expected missing hash, got {other:?}"),
    }

    let no_size = format!(r#"{{ "client": [ {{ "name": "WoW.exe", "type": "file", "hash": "{HASH}" }} ] }}"#);
    match parse_manifest(no_size.as_bytes()) {
        Err(ManifestError::MissingField { field, .. }) => assert_eq!(field, "size"),
        other => panic!("expected missing size, got {other:?}"),
    }
}

#[test]
fn malformed_documents_and_hashes_are_parse_errors() {
    let err = parse_manifest(b"<html>502 Bad Gateway</html>").unwrap_err();
    assert!(matches!(err, ManifestError::Parse(_)), "got {err:?}");

    let bad_hash =
        r#"{ "client": [ { "name": "WoW.exe", "type": "file", "hash": "not-a-hash", "size": 1 } ] }"#;
    assert!(matches!(
        parse_manifest(bad_hash.as_bytes()),
        Err(ManifestError::InvalidHash { .. })
    ));
}

#[test]
fn traversal_in_entry_names_is_rejected() {
    let json = format!(
        r#"{{ "patches": [ {{ "key": "8", "files": [
            {{ "name": "..\\..\\evil.dll", "type": "file", "hash": "{HASH}", "size": 1 }}
        ] }} ] }}"#
    );
    let err = parse_manifest(json.as_bytes()).unwrap_err();
    assert!(matches!(err, ManifestError::UnsafePath(_)));
}
