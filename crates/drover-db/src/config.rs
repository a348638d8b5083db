use std::env;
use std::path::PathBuf;

/// Store configuration.
///
/// Reads from the `DROVER_DB_PATH` environment variable, falling back to
/// `./drover.db` when unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl StoreConfig {
    /// The default database path used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "./drover.db";

    /// Build a config from the environment.
    ///
    /// Priority: `DROVER_DB_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let path = env::var("DROVER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
