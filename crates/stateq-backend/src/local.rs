//! Local filesystem backend.
//!
//! Revisions are the state file and its siblings sharing the same name
//! prefix (`terraform.tfstate`, `terraform.tfstate.backup`, ...), newest
//! modification time first.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address;
use crate::backend::{Backend, SelfDiffer, StateVersionAugmenter, VersionSelector};
use crate::context::BackendContext;
use crate::diff;
use crate::error::{BackendError, BackendResult};
use crate::revision::{sort_newest_first, Locator, RevisionRecord, RunRecord};

/// Default state file name.
pub const STATE_FILE: &str = "terraform.tfstate";

/// Default directory holding non-default workspaces.
pub const WORKSPACE_DIR: &str = "terraform.tfstate.d";

const TYPE_NAME: &str = "local";

/// Local backend configuration as recorded in the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// State file path relative to the root directory.
    #[serde(default)]
    pub path: Option<String>,
    /// Directory holding non-default workspaces.
    #[serde(default)]
    pub workspace_dir: Option<String>,
}

/// Backend over state files in the working directory.
#[derive(Debug)]
pub struct LocalBackend {
    ctx: BackendContext,
    config: LocalConfig,
    versions: Option<Vec<RevisionRecord>>,
    purged: bool,
}

impl LocalBackend {
    /// Backend rooted at `ctx.root_dir`.
    pub fn new(ctx: BackendContext, config: LocalConfig) -> Self {
        Self {
            ctx,
            config,
            versions: None,
            purged: false,
        }
    }

    /// Parent directory and file name prefix of the configured state path.
    fn path_parts(&self) -> (PathBuf, String) {
        let path = Path::new(self.config.path.as_deref().filter(|p| !p.is_empty()).unwrap_or(STATE_FILE));
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STATE_FILE.to_string());
        (parent, prefix)
    }

    /// Directory scanned for revisions.
    pub fn state_dir(&self) -> PathBuf {
        let (parent, _) = self.path_parts();
        match self.ctx.non_default_workspace_env() {
            Some(env) => {
                let workspace_dir = self
                    .config
                    .workspace_dir
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .unwrap_or(WORKSPACE_DIR);
                self.ctx.root_path(workspace_dir).join(env)
            }
            None => self.ctx.root_path(parent),
        }
    }

    async fn scan(&self) -> BackendResult<Vec<RevisionRecord>> {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default)]
            serial: i64,
        }

        let dir = self.state_dir();
        let (_, prefix) = self.path_parts();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("state directory {} does not exist", dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) {
                continue;
            }
            let modified = match entry.metadata().await {
                Ok(meta) if meta.is_file() => match meta.modified() {
                    Ok(modified) => modified,
                    Err(_) => continue,
                },
                _ => continue,
            };
            let path = entry.path();
            let serial = match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<Probe>(&body) {
                    Ok(probe) => probe.serial,
                    Err(e) => {
                        debug!("skipping {}: {}", path.display(), e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            records.push(RevisionRecord::new(
                name,
                DateTime::<Utc>::from(modified),
                serial,
                Locator::Path(path),
            ));
        }

        sort_newest_first(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn runs(&mut self) -> BackendResult<Vec<RunRecord>> {
        Err(BackendError::Unsupported {
            operation: "runs",
            backend: TYPE_NAME,
        })
    }

    async fn states(&mut self, specs: &[String]) -> BackendResult<Vec<Vec<u8>>> {
        let candidates = self.state_versions(None).await?;
        let selected = address::resolve(&candidates, specs)?;
        self.ctx.purge_cache_once(&mut self.purged);

        let mut docs = Vec::with_capacity(selected.len());
        for record in &selected {
            match &record.locator {
                Locator::Path(path) => docs.push(tokio::fs::read(path).await?),
                _ => return Err(BackendError::MissingDocument(record.id.clone())),
            }
        }
        Ok(docs)
    }

    async fn state_versions(
        &mut self,
        augmenter: Option<&StateVersionAugmenter>,
    ) -> BackendResult<Vec<RevisionRecord>> {
        if augmenter.is_some() {
            debug!("local backend ignores list augmenters");
        }
        if let Some(versions) = &self.versions {
            return Ok(versions.clone());
        }
        let records = self.scan().await?;
        debug!("found {} local state files in {}", records.len(), self.state_dir().display());
        self.versions = Some(records.clone());
        Ok(records)
    }

    fn revision_flag(&self) -> String {
        self.ctx.flags.revision.clone()
    }

    fn as_self_differ(&mut self) -> Option<&mut dyn SelfDiffer> {
        Some(self)
    }
}

#[async_trait]
impl SelfDiffer for LocalBackend {
    async fn diff_states(&mut self, selector: &dyn VersionSelector) -> BackendResult<Option<Vec<Vec<u8>>>> {
        let args = self.ctx.flags.diff_args.clone();
        diff::diff_states(self, &args, selector).await
    }
}

impl fmt::Display for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, prefix) = self.path_parts();
        write!(f, "{}", self.state_dir().join(prefix).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_state(dir: &Path, name: &str, body: &str, age_secs: u64) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    fn backend(root: &Path, config: LocalConfig) -> LocalBackend {
        LocalBackend::new(BackendContext::new(root).with_cache(DiskCache::disabled()), config)
    }

    #[tokio::test]
    async fn test_lists_state_and_backup_newest_first() {
        let root = TempDir::new().unwrap();
        write_state(root.path(), "terraform.tfstate.backup", r#"{"serial":4}"#, 600);
        write_state(root.path(), "terraform.tfstate", r#"{"serial":5}"#, 10);
        write_state(root.path(), "main.tf", "resource {}", 0);

        let mut be = backend(root.path(), LocalConfig::default());
        let records = be.state_versions(None).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["terraform.tfstate", "terraform.tfstate.backup"]);
        assert_eq!(records[1].serial, 4);
        assert_eq!(be.state().await.unwrap(), br#"{"serial":5}"#);
    }

    #[tokio::test]
    async fn test_unparseable_files_skipped() {
        let root = TempDir::new().unwrap();
        write_state(root.path(), "terraform.tfstate", r#"{"serial":2}"#, 10);
        write_state(root.path(), "terraform.tfstate.lock.info", "not json", 0);

        let mut be = backend(root.path(), LocalConfig::default());
        let records = be.state_versions(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].serial, 2);
    }

    #[tokio::test]
    async fn test_workspace_directory() {
        let root = TempDir::new().unwrap();
        let ws = root.path().join("terraform.tfstate.d").join("staging");
        write_state(&ws, "terraform.tfstate", r#"{"serial":9}"#, 0);
        write_state(root.path(), "terraform.tfstate", r#"{"serial":1}"#, 0);

        let ctx = BackendContext::new(root.path()).with_env_override("staging");
        let mut be = LocalBackend::new(ctx, LocalConfig::default());
        assert_eq!(be.state_dir(), ws);
        assert_eq!(be.state_versions(None).await.unwrap()[0].serial, 9);

        let ctx = BackendContext::new(root.path()).with_env_override("default");
        let be = LocalBackend::new(ctx, LocalConfig::default());
        assert_eq!(be.state_dir(), root.path());
    }

    #[test]
    fn test_configured_path_and_workspace_dir() {
        let root = TempDir::new().unwrap();
        let config = LocalConfig {
            path: Some("state/net.tfstate".to_string()),
            workspace_dir: Some("ws".to_string()),
        };
        let be = backend(root.path(), config.clone());
        assert_eq!(be.state_dir(), root.path().join("state"));
        assert_eq!(be.to_string(), root.path().join("state/net.tfstate").display().to_string());

        let ctx = BackendContext::new(root.path()).with_env_override("prod");
        let be = LocalBackend::new(ctx, config);
        assert_eq!(be.state_dir(), root.path().join("ws/prod"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let root = TempDir::new().unwrap();
        let ctx = BackendContext::new(root.path()).with_env_override("ghost");
        let mut be = LocalBackend::new(ctx, LocalConfig::default());
        assert!(be.state_versions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runs_unsupported() {
        let root = TempDir::new().unwrap();
        let mut be = backend(root.path(), LocalConfig::default());
        assert!(matches!(
            be.runs().await,
            Err(BackendError::Unsupported { backend: "local", .. })
        ));
    }
}
