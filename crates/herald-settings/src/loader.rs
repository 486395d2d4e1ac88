//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HeraldSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HERALD_*` environment overrides (highest priority)
//! 4. [`HeraldSettings::validate`] clamps what it can and rejects the rest

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::HeraldSettings;

/// Base directory for herald state (`~/.herald`).
pub fn herald_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".herald")
}

/// Resolve the path to the settings file (`~/.herald/settings.json`).
pub fn settings_path() -> PathBuf {
    herald_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HeraldSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with process env overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HeraldSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings reading overrides through `env` instead of the process environment.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<HeraldSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(HeraldSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HeraldSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HERALD_*` overrides. Unparseable values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut HeraldSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| env(name).filter(|v| !v.trim().is_empty());

    if let Some(raw) = read("HERALD_PORT") {
        match parse_u16_range(&raw, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "HERALD_PORT", value = %raw, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("HERALD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("HERALD_DB_PATH") {
        settings.database.path = Some(v);
    }
    if let Some(v) = read("HERALD_BRIDGE_URL") {
        settings.transport.bridge_url = v;
    }
    if let Some(raw) = read("HERALD_POLL_INTERVAL_SECS") {
        match parse_u64_range(&raw, 1, 86_400) {
            Some(secs) => settings.poller.interval_secs = secs,
            None => warn!(
                key = "HERALD_POLL_INTERVAL_SECS",
                value = %raw,
                "invalid poll interval env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("HERALD_ADMIN_RECIPIENT") {
        settings.notifications.admin_recipient = Some(v);
        settings.notifications.enabled = true;
    }
    if let Some(v) = read("HERALD_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 9091, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9999}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9999);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"a": [1, 2, 3]}),
            serde_json::json!({"a": [9]}),
        );
        assert_eq!(merged["a"], serde_json::json!([9]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_with_env(&dir.path().join("absent.json"), no_env).unwrap();
        assert_eq!(settings.server.port, 9091);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 7000}, "dispatch": {"messagesPerBatch": 4}, "poller": {"intervalSecs": 15}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.dispatch.messages_per_batch, 4);
        assert_eq!(settings.dispatch.delay_between_messages, 3_000);
        assert_eq!(settings.poller.interval_secs, 15);
    }

    #[test]
    fn load_clamps_rate_limit_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"dispatch": {"delayBetweenMessages": 50}}"#).unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.dispatch.delay_between_messages, 1_000);
    }

    #[test]
    fn load_clamps_zero_heartbeat_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"heartbeatIntervalMs": 0}}"#).unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.server.heartbeat_interval_ms, 1_000);
        assert_eq!(settings.server.client_timeout_ms, 90_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_with_env(&path, no_env), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7000}}"#).unwrap();

        let env = env_of(&[
            ("HERALD_PORT", "7100"),
            ("HERALD_DB_PATH", "/var/lib/herald/herald.db"),
            ("HERALD_BRIDGE_URL", "http://bridge:3100"),
            ("HERALD_POLL_INTERVAL_SECS", "30"),
            ("HERALD_ADMIN_RECIPIENT", "15550199"),
            ("HERALD_LOG_LEVEL", "debug"),
        ]);
        let settings = load_with_env(&path, env).unwrap();
        assert_eq!(settings.server.port, 7100);
        assert_eq!(settings.database.path.as_deref(), Some("/var/lib/herald/herald.db"));
        assert_eq!(settings.transport.bridge_url, "http://bridge:3100");
        assert_eq!(settings.poller.interval_secs, 30);
        assert!(settings.notifications.enabled);
        assert_eq!(settings.notifications.admin_recipient.as_deref(), Some("15550199"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = HeraldSettings::default();
        apply_env_overrides(
            &mut settings,
            env_of(&[("HERALD_PORT", "99999"), ("HERALD_POLL_INTERVAL_SECS", "soon")]),
        );
        assert_eq!(settings.server.port, 9091);
        assert_eq!(settings.poller.interval_secs, 60);
    }

    #[test]
    fn bad_env_log_level_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_with_env(
            &dir.path().join("absent.json"),
            env_of(&[("HERALD_LOG_LEVEL", "shouty")]),
        );
        assert!(matches!(result, Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range(" 60 ", 1, 100), Some(60));
        assert_eq!(parse_u64_range("abc", 1, 100), None);
    }

    #[test]
    fn settings_path_under_home() {
        assert!(settings_path().ends_with(".herald/settings.json"));
    }
}
