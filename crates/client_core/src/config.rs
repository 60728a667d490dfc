use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;
use url::Url;

use crate::error::SettingsError;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_sync.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_url: String,
    pub history_limit: u32,
    pub poll_interval: Duration,
    /// Idle time after the last keystroke before `typing-stopped` is sent.
    pub typing_idle: Duration,
    /// How long a peer's `typing-started` stays valid without a stop.
    pub typing_guard: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub auto_mark_seen: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            history_limit: 100,
            poll_interval: Duration::from_secs(10),
            typing_idle: Duration::from_secs(3),
            typing_guard: Duration::from_secs(6),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            auto_mark_seen: true,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let parsed = Url::parse(&self.server_url)
            .map_err(|_| SettingsError::InvalidServerUrl(self.server_url.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SettingsError::InvalidServerUrl(self.server_url.clone()));
        }
        Ok(())
    }
}

/// Defaults, then `chat_sync.toml` in the working directory if present, then
/// `APP__*` environment variables.
pub fn load_settings() -> Result<SyncSettings, SettingsError> {
    let mut settings = SyncSettings::default();
    let path = Path::new(DEFAULT_SETTINGS_FILE);
    if path.exists() {
        apply_file(&mut settings, path)?;
    }
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings_from(path: &Path) -> Result<SyncSettings, SettingsError> {
    let mut settings = SyncSettings::default();
    apply_file(&mut settings, path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn apply_file(settings: &mut SyncSettings, path: &Path) -> Result<(), SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let table: HashMap<String, toml::Value> =
        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    apply_overrides(settings, |key| {
        let key = key.strip_prefix("APP__")?.to_ascii_lowercase();
        match table.get(&key)? {
            toml::Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    });
    Ok(())
}

/// Applies every recognised `APP__*` key that `lookup` resolves.
pub fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = parse_number::<u32>(&lookup, "APP__HISTORY_LIMIT") {
        settings.history_limit = v;
    }
    if let Some(v) = parse_number::<u64>(&lookup, "APP__POLL_INTERVAL_MS") {
        settings.poll_interval = Duration::from_millis(v.max(1));
    }
    if let Some(v) = parse_number::<u64>(&lookup, "APP__TYPING_IDLE_MS") {
        settings.typing_idle = Duration::from_millis(v);
    }
    if let Some(v) = parse_number::<u64>(&lookup, "APP__TYPING_GUARD_MS") {
        settings.typing_guard = Duration::from_millis(v);
    }
    if let Some(v) = parse_number::<u64>(&lookup, "APP__RECONNECT_INITIAL_MS") {
        settings.reconnect_initial_delay = Duration::from_millis(v.max(1));
    }
    if let Some(v) = parse_number::<u64>(&lookup, "APP__RECONNECT_MAX_MS") {
        settings.reconnect_max_delay = Duration::from_millis(v.max(1));
    }
    if let Some(v) = lookup("APP__AUTO_MARK_SEEN") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => settings.auto_mark_seen = true,
            "0" | "false" | "no" | "off" => settings.auto_mark_seen = false,
            other => warn!(value = other, "config: ignoring invalid APP__AUTO_MARK_SEEN"),
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw.as_str(), "config: ignoring non-numeric value");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
