//! Content-addressed disk cache for state documents and revision records.
//!
//! Entries live at `<base>/<namespace...>/<sha256-hex(clear key)>`. The clear
//! key (a download URL, an object version id, a state version id) never
//! reaches the filesystem. Content for a given key is immutable, so writers
//! racing on the same entry overwrite each other with identical bytes and no
//! locking is done.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::env::EnvLookup;
use crate::error::BackendResult;

/// Environment variable that disables caching when set to `0` or `false`.
pub const CACHE_ENABLE_VAR: &str = "STATEQ_CACHE";
/// Environment variable overriding the cache base directory.
pub const CACHE_DIR_VAR: &str = "STATEQ_CACHE_DIR";

const CACHE_SUBDIR: &str = "stateq";

/// Errors raised by cache writes and purges.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A cache directory could not be created.
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A cache entry could not be written.
    #[error("failed to write cache entry {path}: {source}")]
    Write {
        /// Entry path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The cache tree could not be walked.
    #[error("failed to purge cache under {path}: {source}")]
    Purge {
        /// Directory being walked.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// A cached artifact read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Clear-text lookup key.
    pub key: String,
    /// Hex SHA-256 of the key, used as the filename.
    pub encoded_key: String,
    /// Absolute path of the entry.
    pub path: PathBuf,
    /// Whitespace-trimmed payload.
    pub data: Vec<u8>,
}

/// Counters from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Plain files examined.
    pub scanned: u64,
    /// Files removed for being older than the threshold.
    pub removed: u64,
    /// Files that were too old but could not be removed.
    pub failed: u64,
}

/// Handle to the on-disk cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
    base: Option<PathBuf>,
    enabled: bool,
}

/// Encode a clear key into its on-disk filename.
pub fn encode_key(clear_key: &str) -> String {
    hex::encode(Sha256::digest(clear_key.as_bytes()))
}

impl DiskCache {
    /// Resolve the cache from the environment: `STATEQ_CACHE_DIR`, else the
    /// platform cache directory joined with `stateq`.
    pub fn from_env(env: &dyn EnvLookup) -> Self {
        let enabled = !matches!(
            env.var(CACHE_ENABLE_VAR).as_deref(),
            Some("0") | Some("false")
        );
        let base = env
            .non_empty(CACHE_DIR_VAR)
            .map(PathBuf::from)
            .or_else(|| env.cache_dir().map(|d| d.join(CACHE_SUBDIR)));
        Self { base, enabled }
    }

    /// An enabled cache rooted at `base`.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
            enabled: true,
        }
    }

    /// A cache that never hits and never writes.
    pub fn disabled() -> Self {
        Self {
            base: None,
            enabled: false,
        }
    }

    /// True when entries will be read and written.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.base.is_some()
    }

    /// Base directory, if one could be resolved.
    pub fn base_dir(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    /// Path an entry would live at, and whether a file exists there.
    pub fn entry_path(&self, namespace: &[&str], clear_key: &str) -> Option<(PathBuf, bool)> {
        let dir = self.namespace_dir(namespace)?;
        let path = dir.join(encode_key(clear_key));
        let exists = path.is_file();
        Some((path, exists))
    }

    /// Read an entry. Disabled, missing and unreadable entries are all `None`.
    pub fn read(&self, namespace: &[&str], clear_key: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let (path, exists) = self.entry_path(namespace, clear_key)?;
        if !exists {
            return None;
        }
        let raw = std::fs::read(&path).ok()?;
        debug!("cache hit: key={}", clear_key);
        Some(CacheEntry {
            key: clear_key.to_string(),
            encoded_key: encode_key(clear_key),
            path,
            data: raw.trim_ascii().to_vec(),
        })
    }

    /// Write an entry with owner-only permissions, creating directories.
    pub fn write(&self, namespace: &[&str], clear_key: &str, data: &[u8]) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(dir) = self.namespace_dir(namespace) else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(encode_key(clear_key));
        write_owner_only(&path, data).map_err(|source| CacheError::Write {
            path: path.clone(),
            source,
        })?;
        debug!("cache write: key={}", clear_key);
        Ok(())
    }

    /// Remove plain files older than `hours`. A non-positive threshold is a
    /// no-op.
    pub fn purge(&self, hours: i64) -> Result<PurgeStats, CacheError> {
        let mut stats = PurgeStats::default();
        if hours <= 0 {
            debug!("cache cleaning disabled");
            return Ok(stats);
        }
        let Some(base) = self.base.as_deref() else {
            return Ok(stats);
        };
        let max_age = Duration::from_secs(hours.unsigned_abs().saturating_mul(3600));
        purge_dir(base, max_age, &mut stats)?;
        Ok(stats)
    }

    /// Check the cache, else run `fetch` and write its result through.
    /// Write failures are logged and never returned.
    pub async fn fetch_through<F, Fut>(
        &self,
        namespace: &[&str],
        clear_key: &str,
        fetch: F,
    ) -> BackendResult<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<Vec<u8>>>,
    {
        if let Some(entry) = self.read(namespace, clear_key) {
            debug!("cache hit: {}", entry.path.display());
            return Ok(entry.data);
        }
        let data = fetch().await?;
        if let Err(e) = self.write(namespace, clear_key, &data) {
            warn!("failed to write to cache: {}", e);
        }
        Ok(data)
    }

    fn namespace_dir(&self, namespace: &[&str]) -> Option<PathBuf> {
        let mut dir = self.base.clone()?;
        for segment in namespace.iter().filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        Some(dir)
    }
}

fn write_owner_only(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)
}

fn purge_dir(dir: &Path, max_age: Duration, stats: &mut PurgeStats) -> Result<(), CacheError> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Concurrent jobs sharing the cache can remove entries mid-walk.
            Err(e) if e.io_error().is_some_and(|err| err.kind() == io::ErrorKind::NotFound) => continue,
            Err(e) => {
                return Err(CacheError::Purge {
                    path: e.path().unwrap_or(dir).to_path_buf(),
                    source: e.into(),
                })
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };

        stats.scanned += 1;
        let expired = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .is_some_and(|age| age > max_age);
        if !expired {
            continue;
        }
        let path = entry.path();
        match std::fs::remove_file(path) {
            Ok(()) => {
                stats.removed += 1;
                debug!("removed cache file {}", path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => stats.removed += 1,
            Err(e) => {
                stats.failed += 1;
                warn!("failed to remove cache file {}: {}", path.display(), e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use crate::error::BackendError;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn age_file(path: &Path, hours: u64) {
        let when = SystemTime::now() - Duration::from_secs(hours * 3600);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }

    #[test]
    fn test_from_env_dir_override() {
        let env = MapEnv::new()
            .with_var(CACHE_DIR_VAR, "/tmp/custom")
            .with_cache_dir("/home/u/.cache");
        let cache = DiskCache::from_env(&env);
        assert_eq!(cache.base_dir(), Some(Path::new("/tmp/custom")));
        assert!(cache.is_enabled());
    }

    #[test]
    fn test_from_env_platform_default() {
        let env = MapEnv::new().with_cache_dir("/home/u/.cache");
        let cache = DiskCache::from_env(&env);
        assert_eq!(cache.base_dir(), Some(Path::new("/home/u/.cache/stateq")));
    }

    #[test]
    fn test_from_env_disabled() {
        for value in ["0", "false"] {
            let env = MapEnv::new()
                .with_var(CACHE_ENABLE_VAR, value)
                .with_cache_dir("/c");
            assert!(!DiskCache::from_env(&env).is_enabled());
        }
        let env = MapEnv::new().with_var(CACHE_ENABLE_VAR, "1").with_cache_dir("/c");
        assert!(DiskCache::from_env(&env).is_enabled());
    }

    #[test]
    fn test_write_read_trims_whitespace() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        cache
            .write(&["app.terraform.io", "acme"], "https://x/sv-1", b"  {\"serial\":1}\n\n")
            .unwrap();

        let entry = cache.read(&["app.terraform.io", "acme"], "https://x/sv-1").unwrap();
        assert_eq!(entry.data, b"{\"serial\":1}");
        assert_eq!(entry.key, "https://x/sv-1");
        assert_eq!(entry.encoded_key, encode_key("https://x/sv-1"));
        assert_eq!(
            entry.path,
            dir.path()
                .join("app.terraform.io")
                .join("acme")
                .join(encode_key("https://x/sv-1"))
        );
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        cache.write(&["host-a", "org"], "k", b"a").unwrap();
        cache.write(&["host-b", "org"], "k", b"b").unwrap();
        assert_eq!(cache.read(&["host-a", "org"], "k").unwrap().data, b"a");
        assert_eq!(cache.read(&["host-b", "org"], "k").unwrap().data, b"b");
    }

    #[test]
    fn test_read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        assert!(cache.read(&["ns"], "absent").is_none());
        let (path, exists) = cache.entry_path(&["ns"], "absent").unwrap();
        assert!(!exists);
        assert!(path.ends_with(encode_key("absent")));
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = DiskCache::disabled();
        cache.write(&["ns"], "k", b"data").unwrap();
        assert!(cache.read(&["ns"], "k").is_none());
        assert_eq!(cache.purge(1).unwrap(), PurgeStats::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        cache.write(&["ns"], "k", b"data").unwrap();
        let (path, _) = cache.entry_path(&["ns"], "k").unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_encode_key_is_sha256_hex() {
        assert_eq!(
            encode_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(encode_key("abc"), encode_key("abc"));
        assert_eq!(encode_key("abc").len(), 64);
    }

    #[test]
    fn test_purge_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        cache.write(&["a"], "old", b"1").unwrap();
        cache.write(&["a", "b", "c"], "old-nested", b"2").unwrap();
        cache.write(&["a"], "fresh", b"3").unwrap();
        cache.write(&["a", "b"], "fresh-nested", b"4").unwrap();

        let old = cache.entry_path(&["a"], "old").unwrap().0;
        let old_nested = cache.entry_path(&["a", "b", "c"], "old-nested").unwrap().0;
        age_file(&old, 48);
        age_file(&old_nested, 25);

        let stats = cache.purge(24).unwrap();
        assert_eq!(stats.scanned, 4);
        assert_eq!(stats.removed, 2);
        assert!(!old.exists());
        assert!(!old_nested.exists());
        assert!(cache.read(&["a"], "fresh").is_some());
        assert!(cache.read(&["a", "b"], "fresh-nested").is_some());
    }

    #[test]
    fn test_purge_non_positive_is_noop() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        cache.write(&["a"], "old", b"1").unwrap();
        age_file(&cache.entry_path(&["a"], "old").unwrap().0, 1000);

        assert_eq!(cache.purge(0).unwrap().removed, 0);
        assert_eq!(cache.purge(-5).unwrap().removed, 0);
        assert!(cache.read(&["a"], "old").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_purge_does_not_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let foreign = outside.path().join("keep.json");
        std::fs::write(&foreign, "{}").unwrap();
        age_file(&foreign, 100);

        let cache = DiskCache::at(dir.path());
        cache.write(&["a"], "old", b"1").unwrap();
        age_file(&cache.entry_path(&["a"], "old").unwrap().0, 100);
        std::os::unix::fs::symlink(outside.path(), dir.path().join("a").join("link")).unwrap();

        let stats = cache.purge(1).unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.removed, 1);
        assert!(foreign.exists());
    }

    #[test]
    fn test_purge_missing_base_is_ok() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path().join("never-created"));
        assert_eq!(cache.purge(1).unwrap(), PurgeStats::default());
    }

    #[tokio::test]
    async fn test_fetch_through_writes_then_hits() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::at(dir.path());
        let calls = Cell::new(0);
        let origin = || {
            calls.set(calls.get() + 1);
            async { Ok::<_, BackendError>(b"body".to_vec()) }
        };

        let first = cache.fetch_through(&["ns"], "key", origin).await.unwrap();
        assert_eq!(first, b"body");

        let second = cache.fetch_through(&["ns"], "key", origin).await.unwrap();
        assert_eq!(second, b"body");
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_fetch_through_survives_unwritable_cache() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        // The base is a regular file, so directory creation fails.
        let cache = DiskCache::at(&blocker);
        let data = cache
            .fetch_through(&["ns"], "key", || async { Ok::<_, BackendError>(b"origin".to_vec()) })
            .await
            .unwrap();
        assert_eq!(data, b"origin");
    }

    proptest! {
        #[test]
        fn prop_distinct_keys_distinct_names(keys in prop::collection::hash_set(".*", 1..40)) {
            let encoded: HashSet<String> = keys.iter().map(|k| encode_key(k)).collect();
            prop_assert_eq!(encoded.len(), keys.len());
            for name in &encoded {
                prop_assert_eq!(name.len(), 64);
                prop_assert!(name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            }
        }

        #[test]
        fn prop_round_trip_trims(body in "[ \t\n]{0,3}[a-zA-Z0-9{}\":,]{1,200}[ \t\n]{0,3}", key in "\\PC{0,40}") {
            let dir = TempDir::new().unwrap();
            let cache = DiskCache::at(dir.path());
            cache.write(&["ns"], &key, body.as_bytes()).unwrap();
            let entry = cache.read(&["ns"], &key).unwrap();
            prop_assert_eq!(entry.data, body.trim().as_bytes().to_vec());
        }
    }
}
