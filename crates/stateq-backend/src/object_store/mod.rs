//! Versioned object store backend.
//!
//! Every write of the state key creates a new object version; deleting the
//! key leaves a delete marker. The revision list is the key's versions
//! written after its newest delete marker, ordered by modification time and
//! cut at the first version whose document has no serial.

mod mock;
mod s3;

pub use mock::{MockVersionStore, MockVersionStoreStats};
pub use s3::S3VersionStore;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address;
use crate::backend::{Backend, SelfDiffer, StateVersionAugmenter, VersionSelector};
use crate::context::{BackendContext, DEFAULT_WORKSPACE};
use crate::diff;
use crate::error::{BackendError, BackendResult};
use crate::revision::{document_serial, sort_newest_first, Locator, RevisionRecord, RunRecord};

/// Key prefix for non-default workspaces when the configuration names none.
pub const DEFAULT_WORKSPACE_KEY_PREFIX: &str = "env:";

const TYPE_NAME: &str = "s3";

/// `s3` backend configuration as recorded in the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Bucket name.
    #[serde(default)]
    pub bucket: String,
    /// State object key for the default workspace.
    #[serde(default)]
    pub key: String,
    /// Key prefix for non-default workspaces.
    #[serde(default)]
    pub workspace_key_prefix: Option<String>,
    /// Bucket region.
    #[serde(default)]
    pub region: Option<String>,
    /// Server-side encryption flag.
    #[serde(default)]
    pub encrypt: bool,
    /// KMS key used for server-side encryption.
    #[serde(default)]
    pub kms_key_id: Option<String>,
}

impl ObjectStoreConfig {
    /// Object key holding the state of workspace `env`.
    pub fn object_key(&self, env: Option<&str>) -> String {
        match env.filter(|e| !e.is_empty() && *e != DEFAULT_WORKSPACE) {
            None => self.key.clone(),
            Some(env) => {
                let prefix = self
                    .workspace_key_prefix
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_WORKSPACE_KEY_PREFIX);
                format!("{}/{}/{}", prefix.trim_end_matches('/'), env, self.key)
            }
        }
    }
}

/// One object version or delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    /// Object key.
    pub key: String,
    /// Version id.
    pub version_id: String,
    /// When this version was written.
    pub last_modified: DateTime<Utc>,
}

/// Continuation point of a version listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMarker {
    /// Key to continue after.
    pub key: Option<String>,
    /// Version id to continue after.
    pub version_id: Option<String>,
}

/// One page of a version listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionPage {
    /// Object versions on this page.
    pub versions: Vec<ObjectVersion>,
    /// Delete markers on this page.
    pub delete_markers: Vec<ObjectVersion>,
    /// Where the next page starts, `None` on the last page.
    pub next_marker: Option<VersionMarker>,
}

/// The versioned object store operations the backend needs.
#[async_trait]
pub trait ObjectVersionStore: Send + Sync {
    /// One page of versions and delete markers under `prefix`.
    async fn list_versions(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&VersionMarker>,
    ) -> BackendResult<VersionPage>;

    /// Body of one object version.
    async fn get_object(&self, bucket: &str, key: &str, version_id: &str) -> BackendResult<Vec<u8>>;
}

/// Versions of exactly `key` that were written at or after its newest
/// delete marker. A prefix listing also returns sibling keys such as lock
/// files; those are dropped.
pub fn live_versions(key: &str, versions: Vec<ObjectVersion>, delete_markers: &[ObjectVersion]) -> Vec<ObjectVersion> {
    let newest_delete = delete_markers
        .iter()
        .filter(|m| m.key == key)
        .map(|m| m.last_modified)
        .max();
    versions
        .into_iter()
        .filter(|v| {
            if v.key != key {
                debug!("discarding version of {}", v.key);
                return false;
            }
            newest_delete.map_or(true, |deleted| v.last_modified >= deleted)
        })
        .collect()
}

async fn race<T>(cancel: &CancellationToken, fut: impl Future<Output = BackendResult<T>>) -> BackendResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled("object store request")),
        result = fut => result,
    }
}

/// Backend over a versioned bucket.
pub struct ObjectStoreBackend {
    ctx: BackendContext,
    config: ObjectStoreConfig,
    store: Arc<dyn ObjectVersionStore>,
    versions: Option<Vec<RevisionRecord>>,
    purged: bool,
}

impl ObjectStoreBackend {
    /// Backend reading through `store`.
    pub fn new(ctx: BackendContext, config: ObjectStoreConfig, store: Arc<dyn ObjectVersionStore>) -> Self {
        Self {
            ctx,
            config,
            store,
            versions: None,
            purged: false,
        }
    }

    /// Object key of the selected workspace.
    pub fn object_key(&self) -> String {
        self.config.object_key(self.ctx.workspace_env().as_deref())
    }

    fn cache_namespace(&self) -> [String; 3] {
        [
            self.config.bucket.clone(),
            self.config.workspace_key_prefix.clone().unwrap_or_default(),
            self.config.key.clone(),
        ]
    }

    async fn list_all(&self, key: &str) -> BackendResult<(Vec<ObjectVersion>, Vec<ObjectVersion>)> {
        let mut versions = Vec::new();
        let mut delete_markers = Vec::new();
        let mut marker: Option<VersionMarker> = None;
        loop {
            let page = race(
                &self.ctx.cancel,
                self.store.list_versions(&self.config.bucket, key, marker.as_ref()),
            )
            .await?;
            debug!(
                "listed {} versions and {} delete markers under {}",
                page.versions.len(),
                page.delete_markers.len(),
                key
            );
            versions.extend(page.versions);
            delete_markers.extend(page.delete_markers);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok((versions, delete_markers))
    }

    async fn body(&self, key: &str, version_id: &str) -> BackendResult<Vec<u8>> {
        let [bucket, prefix, base_key] = self.cache_namespace();
        let (store, cancel) = (&self.store, &self.ctx.cancel);
        self.ctx
            .cache
            .fetch_through(&[bucket.as_str(), prefix.as_str(), base_key.as_str()], version_id, || {
                race(cancel, store.get_object(&self.config.bucket, key, version_id))
            })
            .await
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
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

        let key = self.object_key();
        let mut docs = Vec::with_capacity(selected.len());
        for record in &selected {
            let doc = match &record.locator {
                Locator::ObjectVersion(version_id) => self.body(&key, version_id).await?,
                Locator::Path(path) => tokio::fs::read(path).await?,
                Locator::Url(_) | Locator::None => return Err(BackendError::MissingDocument(record.id.clone())),
            };
            docs.push(doc);
        }
        Ok(docs)
    }

    async fn state_versions(
        &mut self,
        augmenter: Option<&StateVersionAugmenter>,
    ) -> BackendResult<Vec<RevisionRecord>> {
        if augmenter.is_some() {
            debug!("object store backend ignores list augmenters");
        }
        if let Some(versions) = &self.versions {
            return Ok(versions.clone());
        }

        let key = self.object_key();
        let (versions, delete_markers) = self.list_all(&key).await?;
        let live = live_versions(&key, versions, &delete_markers);

        let mut records = Vec::with_capacity(live.len());
        for version in live {
            let body = match self.body(&key, &version.version_id).await {
                Ok(body) => body,
                Err(BackendError::Cancelled(what)) => return Err(BackendError::Cancelled(what)),
                Err(e) => {
                    warn!("failed to fetch version {} of {}: {}", version.version_id, key, e);
                    continue;
                }
            };
            records.push(RevisionRecord::new(
                version.version_id.clone(),
                version.last_modified,
                document_serial(&body),
                Locator::ObjectVersion(version.version_id),
            ));
        }

        sort_newest_first(&mut records);
        // Versions older than the first serial-less document belong to a
        // previous lineage of the key.
        if let Some(cut) = records.iter().position(|r| r.serial == 0) {
            records.truncate(cut);
        }
        if let Some(limit) = self.ctx.flags.limit.filter(|l| *l > 0) {
            records.truncate(limit);
        }

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
impl SelfDiffer for ObjectStoreBackend {
    async fn diff_states(&mut self, selector: &dyn VersionSelector) -> BackendResult<Option<Vec<Vec<u8>>>> {
        let args = self.ctx.flags.diff_args.clone();
        diff::diff_states(self, &args, selector).await
    }
}

impl fmt::Display for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.config.bucket, self.object_key())
    }
}
