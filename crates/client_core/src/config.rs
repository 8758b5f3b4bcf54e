use std::{collections::HashMap, fs, time::Duration};

use serde::Deserialize;

pub const SETTINGS_FILE: &str = "neumo.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// `None` waits indefinitely, which matches how the web client behaved.
    pub request_timeout_secs: Option<u64>,
    pub storage_url: String,
    pub storage_scope: String,
    pub upload_chunk_size: usize,
    pub max_upload_bytes: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".into(),
            request_timeout_secs: None,
            storage_url: "sqlite://./data/neumo.db".into(),
            storage_scope: "neumo".into(),
            upload_chunk_size: 64 * 1024,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ClientSettings {
    pub fn for_api(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Defaults, then `neumo.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    settings_from_sources(file.as_deref(), |key| std::env::var(key).ok())
}

pub fn settings_from_sources(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
            if let Some(v) = file_cfg.get("api_base_url") {
                settings.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("request_timeout_secs") {
                settings.request_timeout_secs = v.parse().ok().or(settings.request_timeout_secs);
            }
            if let Some(v) = file_cfg.get("storage_url") {
                settings.storage_url = v.clone();
            }
            if let Some(v) = file_cfg.get("storage_scope") {
                settings.storage_scope = v.clone();
            }
        }
    }

    if let Some(v) = env("NEUMO_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("NEUMO_REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = Some(parsed);
        }
    }

    if let Some(v) = env("NEUMO_STORAGE_URL") {
        settings.storage_url = v;
    }
    if let Some(v) = env("APP__STORAGE_URL") {
        settings.storage_url = v;
    }

    if let Some(v) = env("NEUMO_STORAGE_SCOPE") {
        settings.storage_scope = v;
    }

    settings
}
