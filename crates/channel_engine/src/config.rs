use std::{fs, path::Path};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "engine.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Stored events read per catch-up.
    pub catch_up_count: usize,
    pub event_buffer: usize,
    pub database_url: String,
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            catch_up_count: 50,
            event_buffer: 1024,
            database_url: "sqlite://./data/engine.db".into(),
            log_filter: "info".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    catch_up_count: Option<usize>,
    event_buffer: Option<usize>,
    database_url: Option<String>,
    log_filter: Option<String>,
}

/// Defaults, then the TOML file at `path` when it exists, then `APP__*` variables.
pub fn load_settings(path: impl AsRef<Path>) -> EngineSettings {
    let mut settings = EngineSettings::default();

    let path = path.as_ref();
    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut EngineSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.catch_up_count {
        settings.catch_up_count = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
}

fn apply_env_overrides(settings: &mut EngineSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("CATCH_UP_COUNT").and_then(|v| v.parse().ok()) {
        settings.catch_up_count = v;
    }
    if let Some(v) = var("EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.event_buffer = v;
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("LOG_FILTER") {
        settings.log_filter = v;
    }
}

/// Normalizes `raw_database_url` and creates the parent directory of a SQLite file.
pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return EngineSettings::default().database_url;
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
