use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    FileIo { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    FileParse { path: PathBuf, source: toml::de::Error },

    #[error("cache_dir must not be empty")]
    EmptyCacheDir,
}
