use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;
use url::Url;

use crate::{connection::BackoffPolicy, error::ClientError};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub push_url: String,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub fetch_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            push_url: "ws://127.0.0.1:8091/ws".into(),
            max_retries: 3,
            base_retry_delay_ms: 1000,
            fetch_limit: 100,
        }
    }
}

impl ClientSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_retry_delay_ms),
        )
    }

    /// Push endpoint with `http(s)` rewritten to `ws(s)`.
    pub fn push_endpoint(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(self.push_url.trim())
            .map_err(|err| ClientError::Config(format!("push_url '{}': {err}", self.push_url)))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ClientError::Config(format!(
                    "push_url must use ws, wss, http or https (got {other})"
                )))
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ClientError::Config(format!(
                "push_url scheme cannot be rewritten: {}",
                self.push_url
            )));
        }
        Ok(url)
    }

    pub fn api_base(&self) -> String {
        self.api_base_url.trim().trim_end_matches('/').to_string()
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// File values first, then environment overrides. `env` is injected so tests
/// do not have to mutate the process environment.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file_values(&mut settings, &file_cfg),
            Err(err) => warn!(path = %path.display(), "ignoring unreadable settings file: {err}"),
        }
    }

    for key in ["TEAMSYNC_API_URL", "APP__API_BASE_URL"] {
        if let Some(v) = env(key) {
            settings.api_base_url = v;
        }
    }
    for key in ["TEAMSYNC_PUSH_URL", "APP__PUSH_URL"] {
        if let Some(v) = env(key) {
            settings.push_url = v;
        }
    }
    if let Some(v) = env("APP__MAX_RETRIES") {
        override_number(&mut settings.max_retries, "APP__MAX_RETRIES", &v);
    }
    if let Some(v) = env("APP__BASE_RETRY_DELAY_MS") {
        override_number(&mut settings.base_retry_delay_ms, "APP__BASE_RETRY_DELAY_MS", &v);
    }
    if let Some(v) = env("APP__FETCH_LIMIT") {
        override_number(&mut settings.fetch_limit, "APP__FETCH_LIMIT", &v);
    }

    settings
}

fn apply_file_values(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("api_base_url").and_then(toml::Value::as_str) {
        settings.api_base_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("push_url").and_then(toml::Value::as_str) {
        settings.push_url = v.to_string();
    }
    if let Some(v) = file_cfg
        .get("max_retries")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
    {
        settings.max_retries = v;
    }
    if let Some(v) = file_cfg
        .get("base_retry_delay_ms")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.base_retry_delay_ms = v;
    }
    if let Some(v) = file_cfg
        .get("fetch_limit")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
    {
        settings.fetch_limit = v;
    }
}

fn override_number<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = raw, "ignoring non-numeric settings override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
