//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CoworkSettings::default()`]
//! 2. If `~/.cowork/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `COWORK_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::CoworkSettings;

/// Resolve the path to the settings file (`~/.cowork/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cowork").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CoworkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged result
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CoworkSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<CoworkSettings> {
    let defaults = serde_json::to_value(CoworkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Invalid values are logged and ignored, falling back to file/default.
pub fn apply_env_overrides(
    settings: &mut CoworkSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    // ── Agent ───────────────────────────────────────────────────────
    if let Some(v) = env.string("COWORK_CLAUDE_PATH") {
        settings.agent.executable = v;
    }
    if let Some(v) = env.string("COWORK_MODEL") {
        settings.agent.default_model = Some(v);
    }
    if let Some(v) = env.string("COWORK_PERMISSION_MODE") {
        settings.agent.permission_mode = v;
    }
    if let Some(v) = env.string("COWORK_MACHINE_ID") {
        settings.agent.machine_id = Some(v);
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("COWORK_IDLE_TIMEOUT_MS", 10_000, 86_400_000) {
        settings.session.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("COWORK_WATCHDOG_INTERVAL_MS", 100, 600_000) {
        settings.session.watchdog_interval_ms = v;
    }

    // ── Permissions / document ──────────────────────────────────────
    if let Some(v) = env.u64("COWORK_PERMISSION_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.permissions.response_timeout_ms = Some(v);
    }
    if let Some(v) = env.u64("COWORK_SCHEMA_EPOCH", 1, u64::from(u32::MAX)) {
        settings.document.schema_epoch = u32::try_from(v).unwrap_or(u32::MAX);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COWORK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COWORK_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"session": {"idleTimeoutMs": 1, "watchdogIntervalMs": 2}});
        let source = serde_json::json!({"session": {"idleTimeoutMs": 9}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["session"]["idleTimeoutMs"], 9);
        assert_eq!(merged["session"]["watchdogIntervalMs"], 2);
    }

    #[test]
    fn merge_skips_null() {
        let merged = deep_merge(
            serde_json::json!({"a": 1}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_replaces_arrays() {
        let merged = deep_merge(
            serde_json::json!({"tools": ["Read", "Grep"]}),
            serde_json::json!({"tools": ["Bash"]}),
        );
        assert_eq!(merged["tools"], serde_json::json!(["Bash"]));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("100", 100, 200), Some(100));
        assert_eq!(parse_u64_range("201", 100, 200), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = CoworkSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("COWORK_CLAUDE_PATH", "/usr/local/bin/claude"),
                ("COWORK_IDLE_TIMEOUT_MS", "60000"),
                ("COWORK_LOG_JSON", "true"),
                ("COWORK_PERMISSION_TIMEOUT_MS", "5000"),
                ("COWORK_SCHEMA_EPOCH", "4"),
            ]),
        );
        assert_eq!(s.agent.executable, "/usr/local/bin/claude");
        assert_eq!(s.session.idle_timeout_ms, 60_000);
        assert!(s.logging.json);
        assert_eq!(s.permissions.response_timeout_ms, Some(5_000));
        assert_eq!(s.document.schema_epoch, 4);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = CoworkSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("COWORK_IDLE_TIMEOUT_MS", "5"),
                ("COWORK_LOG_JSON", "perhaps"),
                ("COWORK_MODEL", ""),
            ]),
        );
        assert_eq!(s.session.idle_timeout_ms, 300_000);
        assert!(!s.logging.json);
        assert!(s.agent.default_model.is_none());
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = merge_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.agent.executable, "claude");
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"permissions": {"autoApproveTools": ["Read"], "responseTimeoutMs": 30000}}"#,
        )
        .unwrap();
        let s = merge_file(&path).unwrap();
        assert_eq!(s.permissions.auto_approve_tools, vec!["Read".to_string()]);
        assert_eq!(s.permissions.response_timeout_ms, Some(30_000));
        assert_eq!(s.session.watchdog_interval_ms, 30_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(merge_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_merged_result_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"session": {"idleTimeoutMs": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }
}
