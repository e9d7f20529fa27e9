//! Typed, fully-resolved settings — the output of [`crate::loader::ConfigLoader`].
//!
//! These are plain value types with no dependency on `oneiric-core`; the
//! embedding binary converts them into `Environment`, `RetryPolicy`,
//! `CircuitBreakerPolicy` and `LifecycleTimeouts` at startup. Keeping this
//! crate a leaf (like the teacher's `ferrex-config`, which `ferrex-server`
//! converts into its own runtime types rather than the other way around)
//! avoids a dependency cycle with `oneiric-core`.

use std::path::PathBuf;
use std::time::Duration;

/// One `(source_label, priority)` pair from `stack_order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOrderEntry {
    pub label: String,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: Option<String>,
    pub refresh_interval: Option<Duration>,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
    pub require_signature: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            refresh_interval: None,
            timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
            retry_jitter: true,
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(30),
            require_signature: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub activation_timeout: Duration,
    pub health_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub hook_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PluginsSettings {
    pub auto_load: bool,
    pub entry_points: Vec<String>,
}

/// Provenance of the loaded settings, surfaced for diagnostics rather than
/// consumed by the runtime itself.
#[derive(Debug, Clone, Default)]
pub struct SettingsMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// Fully-resolved settings: compiled defaults, layered with an optional TOML
/// file, layered with `ONEIRIC_*` environment variables (highest precedence).
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub stack_order: Vec<StackOrderEntry>,
    /// Raw `ONEIRIC_TRUSTED_PUBLIC_KEYS` value, comma-separated base64
    /// Ed25519 public keys. Parsed by `oneiric_core::safety::TrustedKeySet::parse`.
    pub trusted_public_keys_raw: String,
    pub remote: RemoteSettings,
    pub lifecycle: LifecycleSettings,
    pub plugins: PluginsSettings,
    pub factory_allowlist: Vec<String>,
    pub metadata: SettingsMetadata,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: None,
            cache_dir: PathBuf::from(".oneiric_cache"),
            stack_order: Vec::new(),
            trusted_public_keys_raw: String::new(),
            remote: RemoteSettings::default(),
            lifecycle: LifecycleSettings::default(),
            plugins: PluginsSettings::default(),
            factory_allowlist: Vec::new(),
            metadata: SettingsMetadata::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.cache_dir, PathBuf::from(".oneiric_cache"));
        assert_eq!(settings.remote.retry_attempts, 3);
        assert_eq!(settings.lifecycle.activation_timeout, Duration::from_secs(10));
        assert!(!settings.plugins.auto_load);
    }
}
