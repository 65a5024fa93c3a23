use std::{collections::HashMap, fs};

use serde::Deserialize;
use shared::domain::ReconsiderPolicy;
use tracing::warn;

const SETTINGS_FILE: &str = "server.toml";

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub reconsider_policy: ReconsiderPolicy,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/connections.db".into(),
            reconsider_policy: ReconsiderPolicy::AllowAll,
            max_body_bytes: 16 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml` keys, then environment variables. Later
/// `APP__*` variables win over their short aliases.
pub fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
                    settings.server_bind = v.to_string();
                }
                if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
                    settings.database_url = v.to_string();
                }
                if let Some(v) = file_cfg
                    .get("reconsider_policy")
                    .and_then(toml::Value::as_str)
                {
                    apply_policy(&mut settings, v);
                }
                if let Some(v) = file_cfg.get("max_body_bytes").and_then(toml::Value::as_integer) {
                    if let Ok(v) = usize::try_from(v) {
                        settings.max_body_bytes = v;
                    }
                }
            }
            Err(err) => warn!(%err, "ignoring unreadable {SETTINGS_FILE}"),
        }
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = env(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = env("APP__RECONSIDER_POLICY") {
        apply_policy(&mut settings, &v);
    }
    if let Some(v) = env("APP__MAX_BODY_BYTES") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.max_body_bytes = parsed;
        }
    }

    settings
}

fn apply_policy(settings: &mut Settings, raw: &str) {
    match ReconsiderPolicy::parse(raw) {
        Some(policy) => settings.reconsider_policy = policy,
        None => warn!(value = raw, "unknown reconsider policy; keeping default"),
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
