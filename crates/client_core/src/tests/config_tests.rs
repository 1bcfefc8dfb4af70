use super::*;

use std::collections::HashMap;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_match_reconnect_policy() {
    let settings = ClientSettings::default();
    assert_eq!(settings.reconnect_delay(), Duration::from_secs(3));
    assert_eq!(settings.max_reconnect_attempts, 5);
}

#[test]
fn file_values_accept_strings_and_integers() {
    let mut settings = ClientSettings::default();
    settings
        .apply_file(
            r#"
            server_url = "https://chat.example.com"
            reconnect_delay_ms = 250
            max_reconnect_attempts = "2"
            unrelated = true
            "#,
        )
        .expect("apply file");

    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.reconnect_delay_ms, 250);
    assert_eq!(settings.max_reconnect_attempts, 2);
}

#[test]
fn environment_overrides_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("client.toml");
    fs::write(&path, "server_url = \"http://from-file:1\"\nrequest_timeout_secs = 9\n")
        .expect("write settings");

    let settings = load_settings_from(
        &path,
        env_from(&[
            ("APP__SERVER_URL", "http://from-env:2"),
            ("APP__MAX_RECONNECT_ATTEMPTS", "7"),
        ]),
    );

    assert_eq!(settings.server_url, "http://from-env:2");
    assert_eq!(settings.request_timeout_secs, 9);
    assert_eq!(settings.max_reconnect_attempts, 7);
}

#[test]
fn invalid_numbers_keep_previous_value() {
    let settings = load_settings_from(
        Path::new("/nonexistent/client.toml"),
        env_from(&[("APP__RECONNECT_DELAY_MS", "soon")]),
    );
    assert_eq!(settings.reconnect_delay_ms, 3000);
}

#[test]
fn shorthand_server_url_is_honoured() {
    let settings = load_settings_from(
        Path::new("/nonexistent/client.toml"),
        env_from(&[("CHAT_SERVER_URL", "http://short:3")]),
    );
    assert_eq!(settings.server_url, "http://short:3");
}

#[test]
fn realtime_url_swaps_scheme_and_carries_token() {
    let url = realtime_url("http://localhost:8080/", "abc").expect("url");
    assert_eq!(url.as_str(), "ws://localhost:8080/ws?token=abc");

    let secure = realtime_url("https://chat.example.com", "a b&c").expect("secure url");
    assert_eq!(secure.scheme(), "wss");
    assert_eq!(
        secure.query_pairs().find(|(k, _)| k == "token").map(|(_, v)| v.into_owned()),
        Some("a b&c".to_string())
    );
}

#[test]
fn realtime_url_rejects_other_schemes() {
    let err = realtime_url("ftp://example.com", "t").expect_err("must reject");
    assert!(matches!(err, ConnectionError::InvalidUrl(_)));
}
