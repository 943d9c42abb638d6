use super::*;

use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_file(contents: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = env::temp_dir().join(format!("teamsync_client_config_{suffix}"));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("client.toml");
    fs::write(&path, contents).expect("write settings");
    path
}

#[test]
fn defaults_match_reconnect_policy() {
    let settings = load_settings_from(Path::new("/nonexistent/client.toml"), |_| None);
    assert_eq!(settings, ClientSettings::default());

    let policy = settings.backoff_policy();
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.base_delay, Duration::from_millis(1000));
}

#[test]
fn file_values_are_overridden_by_environment() {
    let path = temp_settings_file(
        r#"
api_base_url = "http://gateway:8080"
push_url = "http://push:8091/ws"
max_retries = 5
fetch_limit = 20
"#,
    );

    let settings = load_settings_from(&path, |key| match key {
        "APP__PUSH_URL" => Some("wss://push.example/ws".to_string()),
        "APP__BASE_RETRY_DELAY_MS" => Some("250".to_string()),
        _ => None,
    });

    assert_eq!(settings.api_base_url, "http://gateway:8080");
    assert_eq!(settings.push_url, "wss://push.example/ws");
    assert_eq!(settings.max_retries, 5);
    assert_eq!(settings.base_retry_delay_ms, 250);
    assert_eq!(settings.fetch_limit, 20);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn non_numeric_override_keeps_previous_value() {
    let settings = load_settings_from(Path::new("/nonexistent/client.toml"), |key| {
        (key == "APP__MAX_RETRIES").then(|| "lots".to_string())
    });
    assert_eq!(settings.max_retries, 3);
}

#[test]
fn push_endpoint_rewrites_http_schemes() {
    let mut settings = ClientSettings {
        push_url: "http://push:8091/ws".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.push_endpoint().expect("endpoint").as_str(),
        "ws://push:8091/ws"
    );

    settings.push_url = "https://push.example/ws".into();
    assert_eq!(settings.push_endpoint().expect("endpoint").scheme(), "wss");

    settings.push_url = "ftp://push.example/ws".into();
    assert!(matches!(
        settings.push_endpoint(),
        Err(ClientError::Config(_))
    ));
}

#[test]
fn api_base_drops_trailing_slash() {
    let settings = ClientSettings {
        api_base_url: "http://gateway:8080/ ".into(),
        ..ClientSettings::default()
    };
    assert_eq!(settings.api_base(), "http://gateway:8080");
}
