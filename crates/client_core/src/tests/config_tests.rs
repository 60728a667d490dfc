use super::*;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let table: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key: &str| table.get(key).cloned()
}

fn temp_settings_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "chat_sync_{name}_{}_{}.toml",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    fs::write(&path, contents).expect("write settings file");
    path
}

#[test]
fn defaults_are_valid() {
    let settings = SyncSettings::default();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.history_limit, 100);
    assert_eq!(settings.poll_interval, Duration::from_secs(10));
    assert!(settings.auto_mark_seen);
}

#[test]
fn overrides_replace_recognised_keys() {
    let mut settings = SyncSettings::default();
    apply_overrides(
        &mut settings,
        lookup_from(&[
            ("APP__SERVER_URL", "https://chat.example.com/"),
            ("APP__HISTORY_LIMIT", "25"),
            ("APP__POLL_INTERVAL_MS", "2500"),
            ("APP__TYPING_IDLE_MS", "800"),
            ("APP__AUTO_MARK_SEEN", "off"),
        ]),
    );

    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.history_limit, 25);
    assert_eq!(settings.poll_interval, Duration::from_millis(2500));
    assert_eq!(settings.typing_idle, Duration::from_millis(800));
    assert!(!settings.auto_mark_seen);
}

#[test]
fn invalid_values_keep_previous_setting() {
    let mut settings = SyncSettings::default();
    apply_overrides(
        &mut settings,
        lookup_from(&[
            ("APP__HISTORY_LIMIT", "lots"),
            ("APP__AUTO_MARK_SEEN", "maybe"),
        ]),
    );
    assert_eq!(settings, SyncSettings::default());
}

#[test]
fn zero_poll_interval_is_clamped() {
    let mut settings = SyncSettings::default();
    apply_overrides(&mut settings, lookup_from(&[("APP__POLL_INTERVAL_MS", "0")]));
    assert_eq!(settings.poll_interval, Duration::from_millis(1));
}

#[test]
fn non_http_server_url_is_rejected() {
    let settings = SyncSettings {
        server_url: "ftp://chat.example.com".into(),
        ..SyncSettings::default()
    };
    assert!(matches!(
        settings.validate(),
        Err(SettingsError::InvalidServerUrl(_))
    ));
}

#[test]
fn settings_file_accepts_native_toml_types() {
    let path = temp_settings_file(
        "native",
        "server_url = \"http://10.0.0.5:9000\"\nhistory_limit = 40\nauto_mark_seen = false\n",
    );
    let mut settings = SyncSettings::default();
    apply_file(&mut settings, &path).expect("apply file");
    let _ = fs::remove_file(&path);

    assert_eq!(settings.server_url, "http://10.0.0.5:9000");
    assert_eq!(settings.history_limit, 40);
    assert!(!settings.auto_mark_seen);
}

#[test]
fn malformed_settings_file_reports_path() {
    let path = temp_settings_file("broken", "history_limit = [\n");
    let mut settings = SyncSettings::default();
    let err = apply_file(&mut settings, &path).expect_err("must fail");
    let _ = fs::remove_file(&path);

    assert!(matches!(err, SettingsError::Parse { .. }));
    assert!(err.to_string().contains("chat_sync_broken"));
}

#[test]
fn missing_settings_file_is_a_read_error() {
    let mut settings = SyncSettings::default();
    let err = apply_file(&mut settings, Path::new("/nonexistent/chat_sync.toml"))
        .expect_err("must fail");
    assert!(matches!(err, SettingsError::Read { .. }));
}
