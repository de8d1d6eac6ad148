use camino::Utf8PathBuf;
use patchwork_config::{ConfigError, Mirror, Settings, SettingsStore, DEFAULT_WORKERS};
use tempfile::tempdir;

fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().into()).unwrap()
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempdir().unwrap();
    let settings = SettingsStore::load(&root(&dir).join("settings.json")).unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.workers(), DEFAULT_WORKERS);
}

#[test]
fn partial_file_overrides_only_named_keys() {
    let dir = tempdir().unwrap();
    let path = root(&dir).join("settings.json");
    std::fs::write(&path, r#"{ "mirror": "linode", "workers": 64 }"#).unwrap();

    let settings = SettingsStore::load(&path).unwrap();
    assert_eq!(settings.mirror, "linode");
    assert_eq!(settings.workers(), 32);
    assert_eq!(settings.max_retries, 3);

    let order: Vec<String> = settings.mirror_order().into_iter().map(|m| m.name).collect();
    assert_eq!(order, vec!["linode", "r2eu", "bunny", "r2", "tc"]);
}

#[test]
fn unknown_mirror_is_rejected() {
    let dir = tempdir().unwrap();
    let path = root(&dir).join("settings.json");
    std::fs::write(&path, r#"{ "mirror": "nowhere" }"#).unwrap();

    assert!(matches!(
        SettingsStore::load(&path),
        Err(ConfigError::UnknownMirror(name)) if name == "nowhere"
    ));
}

#[test]
fn malformed_file_names_its_path() {
    let dir = tempdir().unwrap();
    let path = root(&dir).join("settings.json");
    std::fs::write(&path, "{ workers: ").unwrap();

    let err = SettingsStore::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("settings.json"));
}

#[test]
fn saved_settings_load_back() {
    let dir = tempdir().unwrap();
    let path = root(&dir).join("nested/settings.json");

    let mut settings = Settings::default();
    settings.mirrors.push(Mirror {
        name: "local".into(),
        base_url: Some("http://127.0.0.1:8080/files".into()),
    });
    settings.mirror = "local".into();
    settings.speed_limit_bytes = Some(5 * 1024 * 1024);

    SettingsStore::save(&path, &settings).unwrap();
    assert_eq!(SettingsStore::load(&path).unwrap(), settings);
    assert!(!root(&dir).join("nested/settings.json.tmp").exists());
}
