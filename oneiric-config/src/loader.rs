//! Layered settings resolution: compiled defaults, an optional TOML file,
//! then `ONEIRIC_*` environment variables (highest precedence).
//!
//! Grounded on the teacher's `ferrex-config` loader family (small
//! `resolve_*` functions with explicit precedence, returning a typed
//! error) generalized into one `ConfigLoader::load` entry point that never
//! hard-fails on a recoverable problem — unknown TOML keys and
//! uncompilable allowlist patterns are reported as warnings instead.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ConfigLoadError;
use crate::models::{LifecycleSettings, PluginsSettings, RemoteSettings, Settings, SettingsMetadata, StackOrderEntry};
use crate::sources::{EnvSettings, FileSettings};

const DEFAULT_CONFIG_FILE: &str = "oneiric.toml";
const CONFIG_PATH_ENV: &str = "ONEIRIC_CONFIG";

/// Outcome of a [`ConfigLoader::load`] call: the resolved settings plus any
/// non-fatal problems encountered while resolving them.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Settings,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    /// Explicit override for the TOML file path, bypassing `ONEIRIC_CONFIG`
    /// and the `./oneiric.toml` default. Primarily for tests.
    config_path_override: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path_override = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let _ = dotenvy::dotenv();
        let mut warnings = Vec::new();

        let config_path = self.resolve_config_path();
        let (file_settings, file_path) = match &config_path {
            Some(path) if path.exists() => {
                let (parsed, unknown) = read_file_settings(path)?;
                warnings.extend(unknown.into_iter().map(|key| format!("unknown config key {key:?} in {}", path.display())));
                (parsed, Some(path.clone()))
            }
            Some(path) => {
                warnings.push(format!("config file {} not found, using defaults", path.display()));
                (FileSettings::default(), None)
            }
            None => (FileSettings::default(), None),
        };

        let env_settings = EnvSettings::gather();
        let settings = merge(file_settings, env_settings)?;

        for pattern in &settings.factory_allowlist {
            if let Err(err) = Regex::new(pattern) {
                warnings.push(format!("factory_allowlist pattern {pattern:?} is not a valid regex: {err}"));
            }
        }
        if settings.cache_dir.as_os_str().is_empty() {
            return Err(ConfigLoadError::EmptyCacheDir);
        }

        let config = Settings {
            metadata: SettingsMetadata { config_path: file_path, env_file_loaded: dotenvy::var("ONEIRIC_CONFIG").is_ok() || std::env::var("ONEIRIC_DOTENV_LOADED").is_ok() },
            ..settings
        };
        Ok(ConfigLoad { config, warnings })
    }

    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path_override {
            return Some(path.clone());
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default.exists() { Some(default) } else { None }
    }
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "config_dir",
    "cache_dir",
    "stack_order",
    "trusted_public_keys",
    "remote",
    "lifecycle",
    "plugins",
    "factory_allowlist",
];

fn read_file_settings(path: &Path) -> Result<(FileSettings, Vec<String>), ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::FileIo { path: path.to_path_buf(), source })?;
    let value: toml::Value = raw.parse().map_err(|source| ConfigLoadError::FileParse { path: path.to_path_buf(), source })?;
    let unknown = match value.as_table() {
        Some(table) => table.keys().filter(|key| !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str())).cloned().collect(),
        None => Vec::new(),
    };
    let parsed: FileSettings = toml::from_str(&raw).map_err(|source| ConfigLoadError::FileParse { path: path.to_path_buf(), source })?;
    Ok((parsed, unknown))
}

fn merge(file: FileSettings, env: EnvSettings) -> Result<Settings, ConfigLoadError> {
    let defaults = Settings::default();

    let stack_order = if let Some(entries) = env.stack_order {
        entries.into_iter().map(|(label, priority)| StackOrderEntry { label, priority }).collect()
    } else if !file.stack_order.is_empty() {
        file.stack_order.into_iter().map(|e| StackOrderEntry { label: e.label, priority: e.priority }).collect()
    } else {
        defaults.stack_order
    };

    let remote = RemoteSettings {
        url: env.remote_url.or(file.remote.url),
        refresh_interval: env.remote_refresh_interval.or(file.remote.refresh_interval),
        timeout: env.remote_timeout.or(file.remote.timeout).unwrap_or(defaults.remote.timeout),
        retry_attempts: env.remote_retry_attempts.or(file.remote.retry_attempts).unwrap_or(defaults.remote.retry_attempts),
        retry_base_delay: env.remote_retry_base_delay.or(file.remote.retry_base_delay).unwrap_or(defaults.remote.retry_base_delay),
        retry_max_delay: env.remote_retry_max_delay.or(file.remote.retry_max_delay).unwrap_or(defaults.remote.retry_max_delay),
        retry_jitter: env.remote_retry_jitter.or(file.remote.retry_jitter).unwrap_or(defaults.remote.retry_jitter),
        breaker_failure_threshold: env.remote_breaker_failure_threshold.or(file.remote.breaker_failure_threshold).unwrap_or(defaults.remote.breaker_failure_threshold),
        breaker_reset_timeout: env.remote_breaker_reset_timeout.or(file.remote.breaker_reset_timeout).unwrap_or(defaults.remote.breaker_reset_timeout),
        require_signature: env.remote_require_signature.or(file.remote.require_signature).unwrap_or(defaults.remote.require_signature),
    };

    let lifecycle = LifecycleSettings {
        activation_timeout: env.lifecycle_activation_timeout.or(file.lifecycle.activation_timeout).unwrap_or(defaults.lifecycle.activation_timeout),
        health_timeout: env.lifecycle_health_timeout.or(file.lifecycle.health_timeout).unwrap_or(defaults.lifecycle.health_timeout),
        cleanup_timeout: env.lifecycle_cleanup_timeout.or(file.lifecycle.cleanup_timeout).unwrap_or(defaults.lifecycle.cleanup_timeout),
        hook_timeout: env.lifecycle_hook_timeout.or(file.lifecycle.hook_timeout).unwrap_or(defaults.lifecycle.hook_timeout),
    };

    let plugins = PluginsSettings {
        auto_load: env.plugins_auto_load.or(file.plugins.auto_load).unwrap_or(defaults.plugins.auto_load),
        entry_points: env.plugins_entry_points.or(file.plugins.entry_points).unwrap_or(defaults.plugins.entry_points),
    };

    Ok(Settings {
        config_dir: env.config_dir.or(file.config_dir).or(defaults.config_dir),
        cache_dir: env.cache_dir.or(file.cache_dir).unwrap_or(defaults.cache_dir),
        stack_order,
        trusted_public_keys_raw: env.trusted_public_keys.or(file.trusted_public_keys).unwrap_or(defaults.trusted_public_keys_raw),
        remote,
        lifecycle,
        plugins,
        factory_allowlist: env.factory_allowlist.or(file.factory_allowlist).unwrap_or(defaults.factory_allowlist),
        metadata: SettingsMetadata::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_falls_back_to_defaults_with_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new().with_config_path(dir.path().join("missing.toml"));
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.config.cache_dir, PathBuf::from(".oneiric_cache"));
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn load_reports_unknown_top_level_keys_as_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oneiric.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "cache_dir = \"/tmp/cache\"\nbogus_key = 1").unwrap();
        let loaded = ConfigLoader::new().with_config_path(path).load().unwrap();
        assert_eq!(loaded.config.cache_dir, PathBuf::from("/tmp/cache"));
        assert!(loaded.warnings.iter().any(|w| w.contains("bogus_key")));
    }

    #[test]
    fn env_overrides_file_for_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oneiric.toml");
        std::fs::write(&path, "cache_dir = \"/tmp/file-cache\"\n").unwrap();
        std::env::set_var("ONEIRIC_CACHE_DIR", "/tmp/env-cache");
        let loaded = ConfigLoader::new().with_config_path(path).load().unwrap();
        std::env::remove_var("ONEIRIC_CACHE_DIR");
        assert_eq!(loaded.config.cache_dir, PathBuf::from("/tmp/env-cache"));
    }

    #[test]
    fn invalid_factory_allowlist_pattern_is_a_warning_not_an_error() {
        std::env::set_var("ONEIRIC_FACTORY_ALLOWLIST", "factories.[");
        let dir = tempfile::tempdir().unwrap();
        let loaded = ConfigLoader::new().with_config_path(dir.path().join("missing.toml")).load().unwrap();
        std::env::remove_var("ONEIRIC_FACTORY_ALLOWLIST");
        assert!(loaded.warnings.iter().any(|w| w.contains("not a valid regex")));
    }
}
