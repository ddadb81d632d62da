//! Everything a backend needs at construction time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::DiskCache;
use crate::config::QueryConfig;
use crate::env::{EnvLookup, ProcessEnv};

/// Name of the default workspace.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Working-directory file naming the selected workspace.
pub const ENVIRONMENT_FILE: &str = ".terraform/environment";

/// Commands that print a single state document.
const STATE_COMMANDS: [&str; 2] = ["sq", "si"];

/// Values handed over from flag parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFlags {
    /// Command being run, e.g. `sq` or `svq`.
    pub command: String,
    /// `--host` override.
    pub host: Option<String>,
    /// `--org` override.
    pub org: Option<String>,
    /// `--workspace` override.
    pub workspace: Option<String>,
    /// Revision address of the document to print.
    pub revision: String,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Diff mode.
    pub diff: bool,
    /// Arguments given to diff mode.
    pub diff_args: Vec<String>,
    /// Re-read each revision with its related resources.
    pub deep: bool,
    /// `--passphrase` for encrypted state.
    pub passphrase: Option<String>,
}

impl Default for QueryFlags {
    fn default() -> Self {
        Self {
            command: String::new(),
            host: None,
            org: None,
            workspace: None,
            revision: "0".to_string(),
            limit: None,
            diff: false,
            diff_args: Vec::new(),
            deep: false,
            passphrase: None,
        }
    }
}

impl QueryFlags {
    /// Flags for `command` with every other value defaulted.
    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// True when only the current revision can ever be needed.
    pub fn current_only(&self) -> bool {
        STATE_COMMANDS.contains(&self.command.as_str()) && self.revision == "0" && !self.diff
    }

    /// The record limit, narrowed to 1 in current-only mode.
    pub fn effective_limit(&self) -> Option<usize> {
        if self.current_only() {
            Some(1)
        } else {
            self.limit.filter(|l| *l > 0)
        }
    }
}

/// Construction record for a backend.
#[derive(Clone)]
pub struct BackendContext {
    /// Working directory holding `.terraform/` and local state files.
    pub root_dir: PathBuf,
    /// Workspace named after `::` in the root directory argument.
    pub env_override: Option<String>,
    /// Parsed flags.
    pub flags: QueryFlags,
    /// User configuration.
    pub config: Arc<QueryConfig>,
    /// Environment variables and user directories.
    pub env: Arc<dyn EnvLookup>,
    /// Disk cache handle.
    pub cache: DiskCache,
    /// Cancels in-flight network calls.
    pub cancel: CancellationToken,
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("root_dir", &self.root_dir)
            .field("env_override", &self.env_override)
            .field("flags", &self.flags)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl BackendContext {
    /// Context over the real process environment with an empty configuration.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        let env: Arc<dyn EnvLookup> = Arc::new(ProcessEnv);
        Self {
            root_dir: root_dir.into(),
            env_override: None,
            flags: QueryFlags::default(),
            config: Arc::new(QueryConfig::empty()),
            cache: DiskCache::from_env(env.as_ref()),
            env,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the flags.
    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Replace the environment. The cache is re-resolved from it.
    pub fn with_env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.cache = DiskCache::from_env(env.as_ref());
        self.env = env;
        self
    }

    /// Replace the cache.
    pub fn with_cache(mut self, cache: DiskCache) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the workspace override.
    pub fn with_env_override(mut self, env: impl Into<String>) -> Self {
        let env = env.into();
        self.env_override = (!env.is_empty()).then_some(env);
        self
    }

    /// Path relative to the root directory.
    pub fn root_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root_dir.join(relative)
    }

    /// Selected workspace: the override, else the trimmed content of
    /// `.terraform/environment`. Empty values read as unset.
    pub fn workspace_env(&self) -> Option<String> {
        if let Some(env) = self.env_override.as_deref().filter(|e| !e.is_empty()) {
            return Some(env.to_string());
        }
        std::fs::read_to_string(self.root_path(ENVIRONMENT_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Purge cache entries older than the configured `cache.clean` hours,
    /// at most once per `purged` flag. Failures are logged.
    pub fn purge_cache_once(&self, purged: &mut bool) {
        if std::mem::replace(purged, true) {
            return;
        }
        let hours = self.config.get_int("cache.clean").unwrap_or(0);
        match self.cache.purge(hours) {
            Ok(stats) if stats.removed > 0 || stats.failed > 0 => debug!(
                "cache purge: scanned={} removed={} failed={}",
                stats.scanned, stats.removed, stats.failed
            ),
            Ok(_) => {}
            Err(e) => warn!("failed to purge cache: {}", e),
        }
    }

    /// Selected workspace other than `default`.
    pub fn non_default_workspace_env(&self) -> Option<String> {
        self.workspace_env().filter(|e| e != DEFAULT_WORKSPACE)
    }
}
