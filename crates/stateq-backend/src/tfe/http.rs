//! reqwest-backed [`TfeApi`] client.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ApiError, RunListOptions, StateVersionListOptions, TfeApi, WorkspaceListOptions};
use crate::paginate::{Page, Pagination};
use crate::revision::{Locator, RevisionRecord, RunRecord, WorkspaceRecord};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const JSON_API: &str = "application/vnd.api+json";

/// Hosted API client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTfeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    cancel: CancellationToken,
}

impl HttpTfeClient {
    /// Client for `host`. A host with a scheme is used as-is, otherwise
    /// `https://` is assumed. Every request is abandoned once `cancel` fires.
    pub fn new(host: &str, token: Option<String>, cancel: CancellationToken) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: api_base_url(host),
            token: token.filter(|t| !t.is_empty()),
            cancel,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn cancellable<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            result = fut => result,
        }
    }

    async fn get_bytes(&self, url: &str, query: &[(String, String)], accept: &str) -> Result<Vec<u8>, ApiError> {
        let request = self
            .authorized(self.client.get(url))
            .header(reqwest::header::ACCEPT, accept)
            .query(query);
        self.cancellable(async {
            debug!("GET {}", url);
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status, url));
            }
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(String, String)]) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let body = self.get_bytes(&url, query, JSON_API).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl TfeApi for HttpTfeClient {
    async fn list_state_versions(
        &self,
        options: &StateVersionListOptions,
    ) -> Result<Page<RevisionRecord>, ApiError> {
        let doc: ListDocument = self.get_json("/state-versions", &options.query_pairs()).await?;
        doc.into_page(|r| state_version_record(r, Vec::new()))
    }

    async fn read_state_version(&self, id: &str, includes: &[&str]) -> Result<RevisionRecord, ApiError> {
        let query = if includes.is_empty() {
            Vec::new()
        } else {
            vec![("include".to_string(), includes.join(","))]
        };
        let doc: SingleDocument = self.get_json(&format!("/state-versions/{id}"), &query).await?;
        state_version_record(doc.data, doc.included)
    }

    async fn list_runs(&self, organization: &str, options: &RunListOptions) -> Result<Page<RunRecord>, ApiError> {
        let path = format!("/organizations/{organization}/runs");
        let doc: ListDocument = self.get_json(&path, &options.query_pairs()).await?;
        doc.into_page(run_record)
    }

    async fn list_workspaces(
        &self,
        organization: &str,
        options: &WorkspaceListOptions,
    ) -> Result<Page<WorkspaceRecord>, ApiError> {
        let path = format!("/organizations/{organization}/workspaces");
        let doc: ListDocument = self.get_json(&path, &options.query_pairs()).await?;
        doc.into_page(workspace_record)
    }

    async fn read_workspace(&self, organization: &str, name: &str) -> Result<WorkspaceRecord, ApiError> {
        let path = format!("/organizations/{organization}/workspaces/{name}");
        let doc: SingleDocument = self.get_json(&path, &[]).await?;
        workspace_record(doc.data)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        self.get_bytes(url, &[], "application/json").await
    }
}

fn api_base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        format!("{host}/api/v2")
    } else {
        format!("https://{host}/api/v2")
    }
}

fn status_error(status: StatusCode, url: &str) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        other => ApiError::Status {
            status: other.as_u16(),
            url: url.to_string(),
        },
    }
}

/// A JSON:API resource object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Resource {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    attributes: serde_json::Value,
    #[serde(default)]
    relationships: serde_json::Value,
}

impl Resource {
    fn detail(&self, included: &[Resource]) -> serde_json::Value {
        let mut detail = serde_json::json!({
            "type": self.kind,
            "attributes": self.attributes,
            "relationships": self.relationships,
        });
        if !included.is_empty() {
            detail["included"] = serde_json::to_value(included).unwrap_or_default();
        }
        detail
    }
}

#[derive(Debug, Deserialize)]
struct ListDocument {
    #[serde(default)]
    data: Vec<Resource>,
    #[serde(default)]
    meta: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default)]
    pagination: Pagination,
}

impl ListDocument {
    fn into_page<T>(self, convert: impl Fn(Resource) -> Result<T, ApiError>) -> Result<Page<T>, ApiError> {
        let items = self.data.into_iter().map(convert).collect::<Result<_, _>>()?;
        Ok(Page {
            items,
            pagination: self.meta.pagination,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SingleDocument {
    data: Resource,
    #[serde(default)]
    included: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateVersionAttributes {
    created_at: DateTime<Utc>,
    #[serde(default)]
    serial: i64,
    #[serde(default)]
    hosted_state_download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RunAttributes {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceAttributes {
    name: String,
}

fn state_version_record(res: Resource, included: Vec<Resource>) -> Result<RevisionRecord, ApiError> {
    let attrs: StateVersionAttributes = serde_json::from_value(res.attributes.clone())?;
    let locator = attrs
        .hosted_state_download_url
        .filter(|u| !u.is_empty())
        .map_or(Locator::None, Locator::Url);
    let mut record = RevisionRecord::new(res.id.clone(), attrs.created_at, attrs.serial, locator);
    record.detail = Some(res.detail(&included));
    Ok(record)
}

fn run_record(res: Resource) -> Result<RunRecord, ApiError> {
    let attrs: RunAttributes = serde_json::from_value(res.attributes.clone())?;
    Ok(RunRecord {
        id: res.id.clone(),
        status: attrs.status.unwrap_or_default(),
        created_at: attrs.created_at,
        message: attrs.message.unwrap_or_default(),
        detail: Some(res.detail(&[])),
    })
}

fn workspace_record(res: Resource) -> Result<WorkspaceRecord, ApiError> {
    let attrs: WorkspaceAttributes = serde_json::from_value(res.attributes.clone())?;
    let current_state_version = res
        .relationships
        .pointer("/current-state-version/data/id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(WorkspaceRecord {
        id: res.id.clone(),
        name: attrs.name,
        current_state_version,
        detail: Some(res.detail(&[])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_VERSIONS: &str = r#"{
        "data": [
            {
                "id": "sv-new",
                "type": "state-versions",
                "attributes": {
                    "created-at": "2024-05-02T10:00:00Z",
                    "serial": 8,
                    "hosted-state-download-url": "https://archivist.example/v1/object/abc"
                }
            },
            {
                "id": "sv-old",
                "type": "state-versions",
                "attributes": { "created-at": "2024-05-01T10:00:00.123Z", "serial": 7 }
            }
        ],
        "meta": { "pagination": { "current-page": 1, "next-page": 2, "total-count": 150 } }
    }"#;

    #[test]
    fn test_api_base_url() {
        assert_eq!(api_base_url("app.terraform.io"), "https://app.terraform.io/api/v2");
        assert_eq!(api_base_url("http://127.0.0.1:8080/"), "http://127.0.0.1:8080/api/v2");
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, "u"), ApiError::Unauthorized));
        assert!(matches!(status_error(StatusCode::NOT_FOUND, "u"), ApiError::NotFound));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "u"),
            ApiError::Status { status: 502, .. }
        ));
    }

    #[test]
    fn test_decode_state_version_page() {
        let doc: ListDocument = serde_json::from_str(STATE_VERSIONS).unwrap();
        let page = doc.into_page(|r| state_version_record(r, Vec::new())).unwrap();
        assert_eq!(page.pagination.next_page, Some(2));
        assert_eq!(page.pagination.total_count, 150);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].serial, 8);
        assert_eq!(
            page.items[0].locator,
            Locator::Url("https://archivist.example/v1/object/abc".to_string())
        );
        assert_eq!(page.items[1].locator, Locator::None);
        assert!(page.items[0].created_at > page.items[1].created_at);
    }

    #[test]
    fn test_decode_last_page_has_no_next() {
        let doc: ListDocument = serde_json::from_str(
            r#"{"data":[],"meta":{"pagination":{"current-page":3,"next-page":null,"total-count":0}}}"#,
        )
        .unwrap();
        let page = doc.into_page(run_record).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.next_page, None);
    }

    #[test]
    fn test_deep_read_keeps_included() {
        let doc: SingleDocument = serde_json::from_str(
            r#"{
                "data": {"id": "sv-1", "type": "state-versions",
                         "attributes": {"created-at": "2024-01-01T00:00:00Z", "serial": 1}},
                "included": [{"id": "wsout-1", "type": "state-version-outputs",
                              "attributes": {"name": "vpc_id", "value": "vpc-1"}}]
            }"#,
        )
        .unwrap();
        let record = state_version_record(doc.data, doc.included).unwrap();
        let detail = record.detail.unwrap();
        assert_eq!(detail["included"][0]["attributes"]["name"], "vpc_id");
    }

    #[test]
    fn test_workspace_current_state_version() {
        let doc: SingleDocument = serde_json::from_str(
            r#"{"data": {"id": "ws-1", "type": "workspaces", "attributes": {"name": "net"},
                "relationships": {"current-state-version": {"data": {"id": "sv-9", "type": "state-versions"}}}}}"#,
        )
        .unwrap();
        let ws = workspace_record(doc.data).unwrap();
        assert_eq!(ws.name, "net");
        assert_eq!(ws.current_state_version.as_deref(), Some("sv-9"));
    }

    #[test]
    fn test_missing_created_at_is_decode_error() {
        let res = Resource {
            id: "sv-x".to_string(),
            kind: "state-versions".to_string(),
            attributes: serde_json::json!({"serial": 1}),
            relationships: serde_json::Value::Null,
        };
        assert!(matches!(
            state_version_record(res, Vec::new()),
            Err(ApiError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = HttpTfeClient::new("http://127.0.0.1:9", None, cancel).unwrap();
        assert!(matches!(
            client.download("http://127.0.0.1:9/state").await,
            Err(ApiError::Cancelled)
        ));
    }
}
