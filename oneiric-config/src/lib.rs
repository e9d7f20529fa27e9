//! Settings loader for the pluggable-component runtime.
//!
//! Resolves a typed [`models::Settings`] from compiled defaults, an
//! optional TOML file, and `ONEIRIC_*` environment variables, in that
//! precedence order. Deliberately depends only on `oneiric-model`: the
//! embedding binary converts the resulting plain-value `Settings` into
//! `oneiric-core`'s richer types (`Environment`, `RetryPolicy`,
//! `CircuitBreakerPolicy`, `LifecycleTimeouts`, `TrustedKeySet`) at
//! startup, the same way `ferrex-server` turns `ferrex-config::Config`
//! into its own runtime state.

pub mod error;
pub mod loader;
pub mod models;
pub mod sources;
mod util;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader};
pub use models::{LifecycleSettings, PluginsSettings, RemoteSettings, Settings, SettingsMetadata, StackOrderEntry};
pub use sources::{EnvSettings, FileSettings};
