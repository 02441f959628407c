//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{chorus_home, ChorusSettings};

/// Resolve the path to the settings file (`~/.chorus/settings.json`).
pub fn settings_path() -> PathBuf {
    chorus_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChorusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChorusSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ChorusSettings> {
    let defaults = serde_json::to_value(ChorusSettings::default())?;

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

/// Apply `CHORUS_*` environment variable overrides.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut ChorusSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Split out so tests don't have
/// to mutate the process environment.
pub fn apply_overrides(settings: &mut ChorusSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let parsed = |name: &str| -> Option<(String, String)> { string(name).map(|v| (name.to_owned(), v)) };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("CHORUS_HOST") {
        settings.server.host = v;
    }
    if let Some((k, v)) = parsed("CHORUS_PORT") {
        if let Some(port) = warn_invalid(&k, &v, parse_u16_range(&v, 0, 65535)) {
            settings.server.port = port;
        }
    }
    if let Some(v) = string("CHORUS_STATIC_DIR") {
        settings.server.static_dir = Some(v);
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = string("CHORUS_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some((k, v)) = parsed("CHORUS_RESET_ON_START") {
        if let Some(b) = warn_invalid(&k, &v, parse_bool(&v)) {
            settings.storage.reset_on_start = b;
        }
    }
    if let Some((k, v)) = parsed("CHORUS_DEDUP_SCOPE") {
        if let Some(scope) = warn_invalid(&k, &v, v.parse().ok()) {
            settings.storage.dedup_scope = scope;
        }
    }

    // ── Recovery ────────────────────────────────────────────────────
    if let Some((k, v)) = parsed("CHORUS_RECOVERY_ENABLED") {
        if let Some(b) = warn_invalid(&k, &v, parse_bool(&v)) {
            settings.recovery.enabled = b;
        }
    }

    // ── Relay ───────────────────────────────────────────────────────
    if let Some((k, v)) = parsed("CHORUS_RELAY_MODE") {
        if let Some(mode) = warn_invalid(&k, &v, v.parse().ok()) {
            settings.relay.mode = mode;
        }
    }
    if let Some(v) = string("CHORUS_RELAY_HUB") {
        settings.relay.hub_addr = v;
    }
    if let Some((k, v)) = parsed("CHORUS_EMBED_HUB") {
        if let Some(b) = warn_invalid(&k, &v, parse_bool(&v)) {
            settings.relay.embed_hub = b;
        }
    }
    if let Some(v) = string("CHORUS_INSTANCE_ID") {
        settings.relay.instance_id = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("CHORUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some((k, v)) = parsed("CHORUS_LOG_JSON") {
        if let Some(b) = warn_invalid(&k, &v, parse_bool(&v)) {
            settings.logging.json = b;
        }
    }
}

fn warn_invalid<T>(key: &str, value: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key, value, "invalid env var, ignoring");
    }
    parsed
}

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
