//! In-memory [`ObjectVersionStore`] for tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ObjectVersion, ObjectVersionStore, VersionMarker, VersionPage};
use crate::error::{BackendError, BackendResult};

/// Call counters for [`MockVersionStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockVersionStoreStats {
    /// Listing pages served.
    pub list_calls: u64,
    /// Object bodies served.
    pub gets: u64,
}

/// Bucket fake. Versions are listed in insertion order; delete markers come
/// with the first page.
#[derive(Debug)]
pub struct MockVersionStore {
    versions: Vec<ObjectVersion>,
    delete_markers: Vec<ObjectVersion>,
    bodies: HashMap<String, Vec<u8>>,
    page_size: usize,
    stats: Mutex<MockVersionStoreStats>,
}

impl Default for MockVersionStore {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            delete_markers: Vec::new(),
            bodies: HashMap::new(),
            page_size: 1000,
            stats: Mutex::new(MockVersionStoreStats::default()),
        }
    }
}

impl MockVersionStore {
    /// An empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add an object version with its body.
    pub fn with_version(mut self, version: ObjectVersion, body: Vec<u8>) -> Self {
        self.bodies.insert(version.version_id.clone(), body);
        self.versions.push(version);
        self
    }

    /// Add a delete marker.
    pub fn with_delete_marker(mut self, marker: ObjectVersion) -> Self {
        self.delete_markers.push(marker);
        self
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MockVersionStoreStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ObjectVersionStore for MockVersionStore {
    async fn list_versions(
        &self,
        _bucket: &str,
        prefix: &str,
        marker: Option<&VersionMarker>,
    ) -> BackendResult<VersionPage> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).list_calls += 1;

        let matching: Vec<_> = self.versions.iter().filter(|v| v.key.starts_with(prefix)).collect();
        let start = marker
            .and_then(|m| m.version_id.as_deref())
            .and_then(|id| matching.iter().position(|v| v.version_id == id))
            .map_or(0, |i| i + 1);
        let end = (start + self.page_size).min(matching.len());
        let page: Vec<ObjectVersion> = matching[start..end].iter().map(|v| (*v).clone()).collect();

        let next_marker = (end < matching.len()).then(|| VersionMarker {
            key: page.last().map(|v| v.key.clone()),
            version_id: page.last().map(|v| v.version_id.clone()),
        });
        let delete_markers = if start == 0 {
            self.delete_markers
                .iter()
                .filter(|m| m.key.starts_with(prefix))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Ok(VersionPage {
            versions: page,
            delete_markers,
            next_marker,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str, version_id: &str) -> BackendResult<Vec<u8>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).gets += 1;
        self.bodies
            .get(version_id)
            .cloned()
            .ok_or_else(|| BackendError::ObjectStore {
                operation: "get object",
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!("no such version {version_id}"),
            })
    }
}
