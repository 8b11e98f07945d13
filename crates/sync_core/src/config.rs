use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    /// Messages requested per chat during the initial load.
    pub message_tail_limit: u32,
    /// Page size for `load_older` when the caller passes zero.
    pub history_page_size: u32,
    /// Capacity of the broadcast channel carrying `ClientEvent`s to the UI.
    pub event_buffer: usize,
    /// Characters of message body kept in alert previews.
    pub alert_preview_chars: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            message_tail_limit: 50,
            history_page_size: 50,
            event_buffer: 1024,
            alert_preview_chars: 120,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the toml file, then environment overrides. Unparseable
/// values are logged and skipped.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    apply_setting(&mut settings, &key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    for (key, names) in [
        ("server_url", ["SYNC_SERVER_URL", "APP__SERVER_URL"]),
        ("message_tail_limit", ["SYNC_MESSAGE_TAIL_LIMIT", "APP__MESSAGE_TAIL_LIMIT"]),
        ("history_page_size", ["SYNC_HISTORY_PAGE_SIZE", "APP__HISTORY_PAGE_SIZE"]),
        ("event_buffer", ["SYNC_EVENT_BUFFER", "APP__EVENT_BUFFER"]),
        ("alert_preview_chars", ["SYNC_ALERT_PREVIEW_CHARS", "APP__ALERT_PREVIEW_CHARS"]),
    ] {
        for name in names {
            if let Some(v) = env(name) {
                apply_setting(&mut settings, key, &v);
            }
        }
    }

    settings
}

fn apply_setting(settings: &mut ClientSettings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "server_url" => settings.server_url = value.trim_end_matches('/').to_string(),
        "message_tail_limit" => parse_into(key, value, &mut settings.message_tail_limit),
        "history_page_size" => parse_into(key, value, &mut settings.history_page_size),
        "event_buffer" => parse_into(key, value, &mut settings.event_buffer),
        "alert_preview_chars" => parse_into(key, value, &mut settings.alert_preview_chars),
        _ => warn!(key, "config: unknown setting"),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "config: ignoring unparseable value"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
