use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use url::Url;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub mirror_database_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            mirror_database_url: "sqlite://./data/client.db".into(),
            request_timeout_secs: 15,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Applies a flat `key = value` TOML document. Unknown keys are ignored.
    pub fn apply_file(&mut self, raw: &str) -> anyhow::Result<()> {
        let table: toml::Table = raw.parse().context("client settings are not valid TOML")?;
        let lookup = |key: &str| {
            table.get(key).and_then(|value| match value {
                toml::Value::String(s) => Some(s.clone()),
                toml::Value::Integer(i) => Some(i.to_string()),
                _ => None,
            })
        };
        self.apply(lookup, "");
        Ok(())
    }

    /// Applies `APP__*` overrides (and the `CHAT_SERVER_URL` shorthand) from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHAT_SERVER_URL") {
            self.server_url = v;
        }
        self.apply(|key| lookup(&format!("APP__{}", key.to_ascii_uppercase())), "APP__");
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>, source: &str) {
        if let Some(v) = lookup("server_url") {
            self.server_url = v;
        }
        if let Some(v) = lookup("mirror_database_url") {
            self.mirror_database_url = v;
        }
        if let Some(v) = lookup("reconnect_delay_ms") {
            match v.parse() {
                Ok(parsed) => self.reconnect_delay_ms = parsed,
                Err(_) => tracing::warn!(%source, value = %v, "ignoring invalid reconnect_delay_ms"),
            }
        }
        if let Some(v) = lookup("max_reconnect_attempts") {
            match v.parse() {
                Ok(parsed) => self.max_reconnect_attempts = parsed,
                Err(_) => {
                    tracing::warn!(%source, value = %v, "ignoring invalid max_reconnect_attempts")
                }
            }
        }
        if let Some(v) = lookup("request_timeout_secs") {
            match v.parse() {
                Ok(parsed) => self.request_timeout_secs = parsed,
                Err(_) => tracing::warn!(%source, value = %v, "ignoring invalid request_timeout_secs"),
            }
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = settings.apply_file(&raw) {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
        }
    }
    settings.apply_env(env);

    settings
}

/// Realtime channel address for `server_url`: the scheme becomes `ws`/`wss`
/// and the access token rides along as the `token` query parameter.
pub fn realtime_url(server_url: &str, access_token: &str) -> Result<Url, ConnectionError> {
    let base = server_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ConnectionError::InvalidUrl(format!(
            "server_url must start with http:// or https://, got '{server_url}'"
        )));
    };

    let mut url = Url::parse(&format!("{ws_base}/ws"))
        .map_err(|err| ConnectionError::InvalidUrl(err.to_string()))?;
    url.query_pairs_mut().append_pair("token", access_token);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
