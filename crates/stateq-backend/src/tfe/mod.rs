//! Hosted API seam.
//!
//! [`TfeApi`] covers the handful of endpoints the backends call. The real
//! client ([`HttpTfeClient`]) speaks JSON:API v2 over reqwest; tests plug in
//! in-memory fakes.

mod http;
mod mock;

pub use http::HttpTfeClient;
pub use mock::{MockTfeApi, MockTfeApiStats};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::BackendError;
use crate::paginate::{ListOptions, Page, Paginated};
use crate::revision::{RevisionRecord, RunRecord, WorkspaceRecord};

/// Host queried when nothing else names one.
pub const DEFAULT_HOST: &str = "app.terraform.io";

/// Relationships included when re-reading a state version in deep mode.
pub const DEEP_INCLUDES: [&str; 3] = ["outputs", "run", "created_by"];

/// Errors raised by hosted API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered 401.
    #[error("unauthorized")]
    Unauthorized,

    /// The API answered 404.
    #[error("resource not found")]
    NotFound,

    /// The API answered another non-success status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The request could not be sent or its body not read.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body did not decode.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

/// Options for listing a workspace's state versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVersionListOptions {
    /// Page options.
    pub list: ListOptions,
    /// Organization name.
    pub organization: String,
    /// Workspace name.
    pub workspace: String,
}

impl StateVersionListOptions {
    /// Query string pairs for this request.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = page_pairs(&self.list);
        pairs.push(("filter[workspace][name]".to_string(), self.workspace.clone()));
        pairs.push(("filter[organization][name]".to_string(), self.organization.clone()));
        pairs
    }
}

/// Options for listing an organization's runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunListOptions {
    /// Page options.
    pub list: ListOptions,
    /// Comma-separated workspace names to restrict to.
    pub workspace_names: Option<String>,
}

impl RunListOptions {
    /// Query string pairs for this request.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = page_pairs(&self.list);
        push_opt(&mut pairs, "filter[workspace_names]", &self.workspace_names);
        pairs
    }
}

/// Options for listing an organization's workspaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceListOptions {
    /// Page options.
    pub list: ListOptions,
    /// Fuzzy name search.
    pub search: Option<String>,
    /// Restrict to a project id.
    pub project_id: Option<String>,
    /// Comma-separated tags that must be present.
    pub tags: Option<String>,
    /// Comma-separated tags that must be absent.
    pub exclude_tags: Option<String>,
}

impl WorkspaceListOptions {
    /// Query string pairs for this request.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = page_pairs(&self.list);
        push_opt(&mut pairs, "search[name]", &self.search);
        push_opt(&mut pairs, "filter[project][id]", &self.project_id);
        push_opt(&mut pairs, "search[tags]", &self.tags);
        push_opt(&mut pairs, "search[exclude-tags]", &self.exclude_tags);
        pairs
    }
}

macro_rules! impl_paginated {
    ($($ty:ty),*) => {
        $(impl Paginated for $ty {
            fn list_options(&self) -> &ListOptions {
                &self.list
            }

            fn list_options_mut(&mut self) -> &mut ListOptions {
                &mut self.list
            }
        })*
    };
}

impl_paginated!(StateVersionListOptions, RunListOptions, WorkspaceListOptions);

fn page_pairs(list: &ListOptions) -> Vec<(String, String)> {
    vec![
        ("page[number]".to_string(), list.page_number.to_string()),
        ("page[size]".to_string(), list.page_size.to_string()),
    ]
}

fn push_opt(pairs: &mut Vec<(String, String)>, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        pairs.push((key.to_string(), v.to_string()));
    }
}

/// The hosted API endpoints used by the remote backend.
#[async_trait]
pub trait TfeApi: Send + Sync {
    /// One page of a workspace's state versions.
    async fn list_state_versions(
        &self,
        options: &StateVersionListOptions,
    ) -> Result<Page<RevisionRecord>, ApiError>;

    /// Read one state version, with optional included relationships.
    async fn read_state_version(&self, id: &str, includes: &[&str]) -> Result<RevisionRecord, ApiError>;

    /// One page of an organization's runs.
    async fn list_runs(&self, organization: &str, options: &RunListOptions) -> Result<Page<RunRecord>, ApiError>;

    /// One page of an organization's workspaces.
    async fn list_workspaces(
        &self,
        organization: &str,
        options: &WorkspaceListOptions,
    ) -> Result<Page<WorkspaceRecord>, ApiError>;

    /// Read a workspace by name.
    async fn read_workspace(&self, organization: &str, name: &str) -> Result<WorkspaceRecord, ApiError>;

    /// Download a raw state document.
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

/// Request context attached to hosted API errors.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Hosted API hostname.
    pub host: String,
    /// Organization name.
    pub organization: String,
    /// Workspace name, empty for organization-level calls.
    pub workspace: String,
    /// What was being attempted, e.g. `list state versions`.
    pub operation: String,
}

impl ErrorContext {
    /// Context for `operation` against `host`/`organization`/`workspace`.
    pub fn new(host: &str, organization: &str, workspace: &str, operation: &str) -> Self {
        Self {
            host: host.to_string(),
            organization: organization.to_string(),
            workspace: workspace.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Per-host token variable: `TF_TOKEN_` plus the host with dots as underscores.
pub fn token_env_var(host: &str) -> String {
    format!("TF_TOKEN_{}", host.replace('.', "_"))
}

fn or_unknown(s: &str) -> String {
    if s.is_empty() {
        "<unknown>".to_string()
    } else {
        s.to_string()
    }
}

/// Map an API error to a user-facing backend error carrying `ctx`.
pub fn friendly(err: ApiError, ctx: &ErrorContext) -> BackendError {
    let operation = if ctx.operation.is_empty() {
        "request".to_string()
    } else {
        ctx.operation.clone()
    };
    match err {
        ApiError::Unauthorized => BackendError::Unauthorized {
            operation,
            host: or_unknown(&ctx.host),
            token_var: token_env_var(&ctx.host),
        },
        ApiError::NotFound if !ctx.workspace.is_empty() => BackendError::WorkspaceNotFound {
            operation,
            workspace: ctx.workspace.clone(),
            organization: or_unknown(&ctx.organization),
            host: or_unknown(&ctx.host),
        },
        ApiError::NotFound => BackendError::OrganizationNotFound {
            operation,
            organization: or_unknown(&ctx.organization),
            host: or_unknown(&ctx.host),
        },
        ApiError::Cancelled => BackendError::Cancelled("hosted API request"),
        source => BackendError::Api {
            operation,
            host: or_unknown(&ctx.host),
            organization: ctx.organization.clone(),
            workspace: ctx.workspace.clone(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(workspace: &str) -> ErrorContext {
        ErrorContext::new("app.terraform.io", "acme", workspace, "list state versions")
    }

    #[test]
    fn test_token_env_var() {
        assert_eq!(token_env_var("app.terraform.io"), "TF_TOKEN_app_terraform_io");
        assert_eq!(token_env_var("tfe"), "TF_TOKEN_tfe");
    }

    #[test]
    fn test_friendly_unauthorized() {
        match friendly(ApiError::Unauthorized, &ctx("net")) {
            BackendError::Unauthorized { operation, host, token_var } => {
                assert_eq!(operation, "list state versions");
                assert_eq!(host, "app.terraform.io");
                assert_eq!(token_var, "TF_TOKEN_app_terraform_io");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_friendly_not_found_depends_on_workspace() {
        assert!(matches!(
            friendly(ApiError::NotFound, &ctx("net")),
            BackendError::WorkspaceNotFound { ref workspace, .. } if workspace == "net"
        ));
        assert!(matches!(
            friendly(ApiError::NotFound, &ctx("")),
            BackendError::OrganizationNotFound { ref organization, .. } if organization == "acme"
        ));
    }

    #[test]
    fn test_friendly_wraps_other_errors() {
        let err = friendly(
            ApiError::Status {
                status: 502,
                url: "https://x".to_string(),
            },
            &ErrorContext::default(),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("request on <unknown>"));
        assert!(msg.contains("502"));
        assert!(matches!(
            friendly(ApiError::Cancelled, &ctx("")),
            BackendError::Cancelled(_)
        ));
    }

    #[test]
    fn test_query_pairs() {
        let opts = StateVersionListOptions {
            list: ListOptions {
                page_number: 2,
                page_size: 1,
            },
            organization: "acme".to_string(),
            workspace: "net".to_string(),
        };
        let pairs = opts.query_pairs();
        assert!(pairs.contains(&("page[number]".to_string(), "2".to_string())));
        assert!(pairs.contains(&("page[size]".to_string(), "1".to_string())));
        assert!(pairs.contains(&("filter[workspace][name]".to_string(), "net".to_string())));

        let ws = WorkspaceListOptions {
            search: Some("prod".to_string()),
            tags: Some(String::new()),
            ..Default::default()
        };
        let keys: Vec<_> = ws.query_pairs().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["page[number]", "page[size]", "search[name]"]);
    }
}
