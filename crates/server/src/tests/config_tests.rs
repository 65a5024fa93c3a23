use super::*;

use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn defaults_without_file_or_env() {
    assert_eq!(load_settings_from(None, no_env), Settings::default());
}

#[test]
fn file_values_override_defaults() {
    let file = r#"
        bind_addr = "0.0.0.0:9000"
        database_url = "sqlite://./var/c.db"
        reconsider_policy = "declined_only"
        max_body_bytes = 2048
    "#;
    let settings = load_settings_from(Some(file), no_env);
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./var/c.db");
    assert_eq!(settings.reconsider_policy, ReconsiderPolicy::DeclinedOnly);
    assert_eq!(settings.max_body_bytes, 2048);
}

#[test]
fn env_overrides_file_and_app_prefix_wins() {
    let file = r#"bind_addr = "0.0.0.0:9000""#;
    let settings = load_settings_from(Some(file), |key| match key {
        "SERVER_BIND" => Some("127.0.0.1:1".to_string()),
        "APP__BIND_ADDR" => Some("127.0.0.1:2".to_string()),
        "APP__RECONSIDER_POLICY" => Some("declined-only".to_string()),
        _ => None,
    });
    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.reconsider_policy, ReconsiderPolicy::DeclinedOnly);
}

#[test]
fn unknown_policy_keeps_default() {
    let settings = load_settings_from(None, |key| {
        (key == "APP__RECONSIDER_POLICY").then(|| "whenever".to_string())
    });
    assert_eq!(settings.reconsider_policy, ReconsiderPolicy::AllowAll);
}

#[test]
fn malformed_file_is_ignored() {
    let settings = load_settings_from(Some("bind_addr = "), no_env);
    assert_eq!(settings, Settings::default());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[tokio::test]
async fn normalized_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("connections_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = normalize_database_url(db_path.to_string_lossy().as_ref());
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
