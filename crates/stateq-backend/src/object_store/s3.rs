//! [`ObjectVersionStore`] over the AWS SDK.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ObjectVersion, ObjectVersionStore, VersionMarker, VersionPage};
use crate::error::{BackendError, BackendResult};

/// Bucket access through the default AWS credential chain.
#[derive(Debug, Clone)]
pub struct S3VersionStore {
    client: Client,
}

fn store_error(operation: &'static str, bucket: &str, key: &str, reason: impl std::fmt::Display) -> BackendError {
    BackendError::ObjectStore {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn to_utc(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl S3VersionStore {
    /// Load the shared AWS configuration, overriding the region when given.
    pub async fn new(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region.filter(|r| !r.is_empty()) {
            debug!("using region {}", region);
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        Self {
            client: Client::new(&config),
        }
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectVersionStore for S3VersionStore {
    async fn list_versions(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&VersionMarker>,
    ) -> BackendResult<VersionPage> {
        let output = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .prefix(prefix)
            .set_key_marker(marker.and_then(|m| m.key.clone()))
            .set_version_id_marker(marker.and_then(|m| m.version_id.clone()))
            .send()
            .await
            .map_err(|e| store_error("list object versions", bucket, prefix, DisplayErrorContext(&e)))?;

        let versions = output
            .versions()
            .iter()
            .filter_map(|v| {
                Some(ObjectVersion {
                    key: v.key()?.to_string(),
                    version_id: v.version_id()?.to_string(),
                    last_modified: to_utc(v.last_modified()?)?,
                })
            })
            .collect();
        let delete_markers = output
            .delete_markers()
            .iter()
            .filter_map(|m| {
                Some(ObjectVersion {
                    key: m.key()?.to_string(),
                    version_id: m.version_id().unwrap_or_default().to_string(),
                    last_modified: to_utc(m.last_modified()?)?,
                })
            })
            .collect();
        let next_marker = output.is_truncated().unwrap_or(false).then(|| VersionMarker {
            key: output.next_key_marker().map(str::to_string),
            version_id: output.next_version_id_marker().map(str::to_string),
        });

        Ok(VersionPage {
            versions,
            delete_markers,
            next_marker,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str, version_id: &str) -> BackendResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| store_error("get object", bucket, key, DisplayErrorContext(&e)))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| store_error("read object body", bucket, key, e))?;
        Ok(body.into_bytes().to_vec())
    }
}
