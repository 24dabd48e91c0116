use std::path::{Path, PathBuf};

use trawl_core::AppError;

/// File name of the cache database inside a download folder.
pub const DEFAULT_CACHE_FILE: &str = "requests.db";

/// Where the SQLite store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    File(PathBuf),
    /// Dropped with the pool; provides no cross-process caching.
    Memory,
}

/// Configuration for the cache connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub location: CacheLocation,
    pub max_connections: u32,
}

impl CacheConfig {
    /// `<folder>/requests.db` with the default pool size.
    pub fn in_folder(folder: impl AsRef<Path>) -> Self {
        Self {
            location: CacheLocation::File(folder.as_ref().join(DEFAULT_CACHE_FILE)),
            max_connections: 5,
        }
    }

    /// An ephemeral store. Pinned to one connection because every SQLite
    /// in-memory connection is its own database.
    pub fn in_memory() -> Self {
        Self {
            location: CacheLocation::Memory,
            max_connections: 1,
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `TRAWL_CACHE_PATH` (optional, defaults to `<download_folder>/requests.db`)
    /// - `TRAWL_CACHE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env(download_folder: impl AsRef<Path>) -> Result<Self, AppError> {
        Self::from_lookup(download_folder, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        download_folder: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AppError> {
        let mut config = match lookup("TRAWL_CACHE_PATH") {
            Some(path) if !path.trim().is_empty() => Self {
                location: CacheLocation::File(PathBuf::from(path)),
                max_connections: 5,
            },
            _ => Self::in_folder(download_folder),
        };

        if let Some(raw) = lookup("TRAWL_CACHE_MAX_CONNECTIONS") {
            let parsed: u32 = raw.parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid TRAWL_CACHE_MAX_CONNECTIONS '{raw}': must be a positive integer"
                ))
            })?;
            if parsed == 0 {
                return Err(AppError::ConfigError(
                    "TRAWL_CACHE_MAX_CONNECTIONS must be at least 1".into(),
                ));
            }
            config.max_connections = parsed;
        }

        Ok(config)
    }
}
