//! Raw, unvalidated configuration as read from each source layer: an
//! optional TOML file and the process environment. [`crate::loader`]
//! resolves these into [`crate::models::Settings`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{parse_bool_var, parse_csv_var};

/// Raw configuration as defined in a TOML file. Every field is optional so a
/// partial file only overrides what it names.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileSettings {
    pub config_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub stack_order: Vec<FileStackOrderEntry>,
    pub trusted_public_keys: Option<String>,
    #[serde(default)]
    pub remote: FileRemoteSettings,
    #[serde(default)]
    pub lifecycle: FileLifecycleSettings,
    #[serde(default)]
    pub plugins: FilePluginsSettings,
    pub factory_allowlist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileStackOrderEntry {
    pub label: String,
    pub priority: i64,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRemoteSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub refresh_interval: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub timeout: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub retry_base_delay: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub retry_max_delay: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_jitter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub breaker_reset_timeout: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_signature: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLifecycleSettings {
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub activation_timeout: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub health_timeout: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub cleanup_timeout: Option<std::time::Duration>,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_serde::option", default)]
    pub hook_timeout: Option<std::time::Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePluginsSettings {
    pub auto_load: Option<bool>,
    pub entry_points: Option<Vec<String>>,
}

/// Configuration values read directly from the process environment.
/// Every `ONEIRIC_*` variable the loader recognizes has a field here.
#[derive(Debug, Default, Clone)]
pub struct EnvSettings {
    pub config_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub stack_order: Option<Vec<(String, i64)>>,
    pub trusted_public_keys: Option<String>,
    pub remote_url: Option<String>,
    pub remote_refresh_interval: Option<std::time::Duration>,
    pub remote_timeout: Option<std::time::Duration>,
    pub remote_retry_attempts: Option<u32>,
    pub remote_retry_base_delay: Option<std::time::Duration>,
    pub remote_retry_max_delay: Option<std::time::Duration>,
    pub remote_retry_jitter: Option<bool>,
    pub remote_breaker_failure_threshold: Option<u32>,
    pub remote_breaker_reset_timeout: Option<std::time::Duration>,
    pub remote_require_signature: Option<bool>,
    pub lifecycle_activation_timeout: Option<std::time::Duration>,
    pub lifecycle_health_timeout: Option<std::time::Duration>,
    pub lifecycle_cleanup_timeout: Option<std::time::Duration>,
    pub lifecycle_hook_timeout: Option<std::time::Duration>,
    pub plugins_auto_load: Option<bool>,
    pub plugins_entry_points: Option<Vec<String>>,
    pub factory_allowlist: Option<Vec<String>>,
}

fn duration_var(name: &str) -> Option<std::time::Duration> {
    std::env::var(name).ok().and_then(|raw| humantime::parse_duration(&raw).ok())
}

fn stack_order_var(name: &str) -> Option<Vec<(String, i64)>> {
    let raw = std::env::var(name).ok()?;
    let mut entries = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (label, priority) = part.split_once(':')?;
        entries.push((label.trim().to_string(), priority.trim().parse().ok()?));
    }
    Some(entries)
}

impl EnvSettings {
    pub fn gather() -> Self {
        Self {
            config_dir: std::env::var("ONEIRIC_CONFIG_DIR").ok().map(PathBuf::from),
            cache_dir: std::env::var("ONEIRIC_CACHE_DIR").ok().map(PathBuf::from),
            stack_order: stack_order_var("ONEIRIC_STACK_ORDER"),
            trusted_public_keys: std::env::var("ONEIRIC_TRUSTED_PUBLIC_KEYS").ok(),
            remote_url: std::env::var("ONEIRIC_REMOTE_URL").ok(),
            remote_refresh_interval: duration_var("ONEIRIC_REMOTE_REFRESH_INTERVAL"),
            remote_timeout: duration_var("ONEIRIC_REMOTE_TIMEOUT"),
            remote_retry_attempts: std::env::var("ONEIRIC_REMOTE_RETRY_ATTEMPTS").ok().and_then(|s| s.parse().ok()),
            remote_retry_base_delay: duration_var("ONEIRIC_REMOTE_RETRY_BASE_DELAY"),
            remote_retry_max_delay: duration_var("ONEIRIC_REMOTE_RETRY_MAX_DELAY"),
            remote_retry_jitter: parse_bool_var("ONEIRIC_REMOTE_RETRY_JITTER"),
            remote_breaker_failure_threshold: std::env::var("ONEIRIC_REMOTE_BREAKER_FAILURE_THRESHOLD").ok().and_then(|s| s.parse().ok()),
            remote_breaker_reset_timeout: duration_var("ONEIRIC_REMOTE_BREAKER_RESET_TIMEOUT"),
            remote_require_signature: parse_bool_var("ONEIRIC_REMOTE_REQUIRE_SIGNATURE"),
            lifecycle_activation_timeout: duration_var("ONEIRIC_LIFECYCLE_ACTIVATION_TIMEOUT"),
            lifecycle_health_timeout: duration_var("ONEIRIC_LIFECYCLE_HEALTH_TIMEOUT"),
            lifecycle_cleanup_timeout: duration_var("ONEIRIC_LIFECYCLE_CLEANUP_TIMEOUT"),
            lifecycle_hook_timeout: duration_var("ONEIRIC_LIFECYCLE_HOOK_TIMEOUT"),
            plugins_auto_load: parse_bool_var("ONEIRIC_PLUGINS_AUTO_LOAD"),
            plugins_entry_points: parse_csv_var("ONEIRIC_PLUGINS_ENTRY_POINTS"),
            factory_allowlist: parse_csv_var("ONEIRIC_FACTORY_ALLOWLIST"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_order_var_parses_label_priority_pairs() {
        std::env::set_var("ONEIRIC_TEST_STACK_ORDER", "local:100, remote:10");
        let parsed = stack_order_var("ONEIRIC_TEST_STACK_ORDER").unwrap();
        assert_eq!(parsed, vec![("local".to_string(), 100), ("remote".to_string(), 10)]);
        std::env::remove_var("ONEIRIC_TEST_STACK_ORDER");
    }

    #[test]
    fn file_settings_defaults_are_all_absent() {
        let settings: FileSettings = toml::from_str("").unwrap();
        assert!(settings.config_dir.is_none());
        assert!(settings.stack_order.is_empty());
    }
}
