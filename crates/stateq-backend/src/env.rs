//! Process environment access.
//!
//! Token, cache and passphrase resolution read environment variables and the
//! user's home directory. They go through [`EnvLookup`] so resolution chains
//! can be exercised without touching the real process environment.

use std::collections::HashMap;
use std::path::PathBuf;

/// Read-only view of environment variables and well-known user directories.
pub trait EnvLookup: Send + Sync {
    /// Value of an environment variable, `None` when unset.
    fn var(&self, key: &str) -> Option<String>;

    /// The user's home directory.
    fn home_dir(&self) -> Option<PathBuf>;

    /// The per-user cache directory of the platform.
    fn cache_dir(&self) -> Option<PathBuf>;

    /// The per-user configuration directory of the platform.
    fn config_dir(&self) -> Option<PathBuf>;

    /// Value of an environment variable, treating the empty string as unset.
    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key).filter(|v| !v.is_empty())
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        dirs::cache_dir()
    }

    fn config_dir(&self) -> Option<PathBuf> {
        dirs::config_dir()
    }
}

/// A fixed environment, used by tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
    home: Option<PathBuf>,
    cache: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl MapEnv {
    /// Create an empty environment with no home or cache directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set the home directory.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Set the platform cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache = Some(dir.into());
        self
    }

    /// Set the platform configuration directory.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config = Some(dir.into());
        self
    }
}

impl EnvLookup for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        self.cache.clone()
    }

    fn config_dir(&self) -> Option<PathBuf> {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_skips_blank() {
        let env = MapEnv::new().with_var("A", "").with_var("B", "x");
        assert_eq!(env.var("A"), Some(String::new()));
        assert_eq!(env.non_empty("A"), None);
        assert_eq!(env.non_empty("B"), Some("x".to_string()));
        assert_eq!(env.non_empty("C"), None);
    }

    #[test]
    fn test_map_env_dirs() {
        let env = MapEnv::new().with_home("/home/u").with_cache_dir("/c");
        assert_eq!(env.home_dir(), Some(PathBuf::from("/home/u")));
        assert_eq!(env.cache_dir(), Some(PathBuf::from("/c")));
        assert_eq!(env.config_dir(), None);
    }
}
