//! Loading order: compiled defaults, then `~/.toolsmith/settings.json`
//! deep-merged over them, then `TOOLSMITH_*` environment variables.
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced,
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ToolsmithSettings;

/// `~/.toolsmith`, or `/tmp/.toolsmith` without a home directory.
pub fn toolsmith_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".toolsmith")
}

pub fn settings_path() -> PathBuf {
    toolsmith_home().join("settings.json")
}

pub fn load_settings() -> Result<ToolsmithSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ToolsmithSettings> {
    let defaults = serde_json::to_value(ToolsmithSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ToolsmithSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut ToolsmithSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut ToolsmithSettings, read: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| read(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read_parsed(&read, "TOOLSMITH_PORT", |v| parse_u16_range(v, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = read_parsed(&read, "TOOLSMITH_PUSH_ENABLED", parse_bool) {
        settings.server.push_enabled = v;
    }
    if let Some(v) = string("TOOLSMITH_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = string("TOOLSMITH_LLM_BASE_URL") {
        settings.llm.base_url = v;
    }
    if let Some(v) = string("TOOLSMITH_DEFAULT_MODEL") {
        settings.llm.default_model = v;
    }
    if let Some(v) = string("TOOLSMITH_RESEARCH_MODEL") {
        settings.llm.research_model = v;
    }
    if let Some(v) = string("TOOLSMITH_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_parsed(&read, "TOOLSMITH_MAX_ATTEMPTS", |v| parse_u32_range(v, 1, 10)) {
        settings.consultant.max_attempts = v;
    }
}

fn read_parsed<T>(read: &impl Fn(&str) -> Option<String>, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let val = read(name)?;
    let result = parse(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env override, ignoring");
    }
    result
}

fn validate(settings: &ToolsmithSettings) -> Result<()> {
    if settings.consultant.max_attempts == 0 {
        return Err(SettingsError::InvalidValue("consultant.maxAttempts must be at least 1".into()));
    }
    if settings.server.send_queue_size == 0 {
        return Err(SettingsError::InvalidValue("server.sendQueueSize must be at least 1".into()));
    }
    if settings.llm.base_url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("llm.baseUrl is empty".into()));
    }
    Ok(())
}

/// Database location with relative paths resolved against [`toolsmith_home`].
pub fn resolve_db_path(settings: &ToolsmithSettings) -> PathBuf {
    let path = PathBuf::from(&settings.storage.db_path);
    if path.is_absolute() {
        path
    } else {
        toolsmith_home().join(path)
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ToolsmithSettings {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut settings = ToolsmithSettings::default();
        apply_overrides(&mut settings, |name| env.get(name).cloned());
        settings
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_and_arrays_replace() {
        let target = serde_json::json!({"a": 1, "steps": ["x", "y"]});
        let source = serde_json::json!({"a": null, "steps": ["z"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["steps"], serde_json::json!(["z"]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, ToolsmithSettings::default().server.port);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"pipeline": {"skipSteps": ["applying_tailwind_styling"]}, "consultant": {"maxAttempts": 2}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.pipeline.skip_steps, vec!["applying_tailwind_styling"]);
        assert_eq!(settings.consultant.max_attempts, 2);
        assert_eq!(settings.consultant.probe_timeout_ms, 10_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn wrong_type_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "eighty"}}"#).unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Shape(_))));
    }

    #[test]
    fn zero_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"consultant": {"maxAttempts": 0}}"#).unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let settings = overrides(&[
            ("TOOLSMITH_PORT", "9191"),
            ("TOOLSMITH_PUSH_ENABLED", "off"),
            ("TOOLSMITH_DEFAULT_MODEL", "gpt-4.1"),
            ("TOOLSMITH_MAX_ATTEMPTS", "5"),
            ("TOOLSMITH_LOG_LEVEL", "debug"),
        ]);
        assert_eq!(settings.server.port, 9191);
        assert!(!settings.server.push_enabled);
        assert_eq!(settings.llm.default_model, "gpt-4.1");
        assert_eq!(settings.consultant.max_attempts, 5);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let settings = overrides(&[
            ("TOOLSMITH_PORT", "0"),
            ("TOOLSMITH_PUSH_ENABLED", "maybe"),
            ("TOOLSMITH_MAX_ATTEMPTS", "0"),
            ("TOOLSMITH_DB_PATH", ""),
        ]);
        let defaults = ToolsmithSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert!(settings.server.push_enabled);
        assert_eq!(settings.consultant.max_attempts, 3);
        assert_eq!(settings.storage.db_path, defaults.storage.db_path);
    }

    #[test]
    fn db_path_resolution() {
        let mut settings = ToolsmithSettings::default();
        assert!(resolve_db_path(&settings).ends_with(".toolsmith/toolsmith.db"));
        settings.storage.db_path = "/var/lib/toolsmith/jobs.db".into();
        assert_eq!(resolve_db_path(&settings), PathBuf::from("/var/lib/toolsmith/jobs.db"));
    }

    #[test]
    fn parsers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u32_range("3", 1, 10), Some(3));
    }
}
