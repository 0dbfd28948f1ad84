use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use chrono::{FixedOffset, Offset, Utc};

pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_url: String,
    pub autosave_interval: Duration,
    /// Offset used when rendering "last saved" timestamps.
    pub display_offset: FixedOffset,
    pub sandbox_cache_path: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            display_offset: Utc.fix(),
            sandbox_cache_path: None,
        }
    }
}

pub fn load_settings() -> SessionSettings {
    let mut settings = SessionSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__AUTOSAVE_INTERVAL_SECS") {
        if let Some(interval) = parse_interval_secs(&v) {
            settings.autosave_interval = interval;
        }
    }
    if let Ok(v) = std::env::var("APP__DISPLAY_UTC_OFFSET_MINUTES") {
        if let Some(offset) = v.trim().parse::<i32>().ok().and_then(offset_from_minutes) {
            settings.display_offset = offset;
        }
    }
    if let Ok(v) = std::env::var("APP__SANDBOX_CACHE_PATH") {
        settings.sandbox_cache_path = Some(PathBuf::from(v));
    }

    settings
}

fn apply_file_settings(settings: &mut SessionSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg
        .get("autosave_interval_secs")
        .and_then(toml::Value::as_integer)
        .and_then(|secs| parse_interval_secs(&secs.to_string()))
    {
        settings.autosave_interval = v;
    }
    if let Some(v) = file_cfg
        .get("display_utc_offset_minutes")
        .and_then(toml::Value::as_integer)
        .and_then(|minutes| i32::try_from(minutes).ok())
        .and_then(offset_from_minutes)
    {
        settings.display_offset = v;
    }
    if let Some(v) = file_cfg.get("sandbox_cache_path").and_then(toml::Value::as_str) {
        settings.sandbox_cache_path = Some(PathBuf::from(v));
    }
}

/// Zero is rejected: a zero period would spin the autosave timer.
fn parse_interval_secs(raw: &str) -> Option<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}

fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}
