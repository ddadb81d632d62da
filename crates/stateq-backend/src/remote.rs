//! Hosted API backend.
//!
//! Host, organization, workspace and token are each resolved through a
//! precedence chain over flags, the pointer file, user configuration and the
//! environment. Revision lists and run lists are memoized per instance;
//! documents and single revision records go through the disk cache.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{self, RevisionAddress};
use crate::backend::{Backend, SelfDiffer, StateVersionAugmenter, VersionSelector};
use crate::context::BackendContext;
use crate::diff;
use crate::env::EnvLookup;
use crate::error::{BackendError, BackendResult};
use crate::paginate::{paginate, Augmenter, ListOptions};
use crate::revision::{sort_newest_first, Locator, RevisionRecord, RunRecord, WorkspaceRecord};
use crate::tfe::{
    friendly, token_env_var, ApiError, ErrorContext, HttpTfeClient, RunListOptions, StateVersionListOptions,
    TfeApi, WorkspaceListOptions, DEEP_INCLUDES, DEFAULT_HOST,
};

/// Environment variable overriding the host segment of the cache namespace.
pub const CACHE_HOST_VAR: &str = "TFE_HOSTNAME";
/// Environment variable overriding the organization segment of the cache namespace.
pub const CACHE_ORG_VAR: &str = "TFE_ORGANIZATION";

const CREDENTIALS_FILE: &str = ".terraform.d/credentials.tfrc.json";
const TYPE_NAME: &str = "remote";

/// `workspaces` block of a remote backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacesBlock {
    /// Exact workspace name.
    #[serde(default)]
    pub name: Option<String>,
    /// Workspace name prefix, completed by the selected environment.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Remote backend configuration as recorded in the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Hosted API hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Organization name.
    #[serde(default)]
    pub organization: Option<String>,
    /// API token. Kept as a raw value; anything other than a string is ignored.
    #[serde(default)]
    pub token: Option<serde_json::Value>,
    /// Workspace selection.
    #[serde(default)]
    pub workspaces: Option<WorkspacesBlock>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Host: flag, pointer file, config `host`, else the public host.
pub fn resolve_host(ctx: &BackendContext, config: &RemoteConfig) -> String {
    non_empty(ctx.flags.host.as_deref())
        .or_else(|| non_empty(config.hostname.as_deref()))
        .or_else(|| non_empty(ctx.config.get_string("host").as_deref()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// Token: `TF_TOKEN_<host>`, `TF_TOKEN`, pointer file, config `token`, then
/// the Terraform CLI credentials file. No token at all is allowed.
pub fn resolve_token(ctx: &BackendContext, config: &RemoteConfig, host: &str) -> Option<String> {
    let env = ctx.env.as_ref();
    env.non_empty(&token_env_var(host))
        .or_else(|| env.non_empty("TF_TOKEN"))
        .or_else(|| non_empty(config.token.as_ref().and_then(|t| t.as_str())))
        .or_else(|| non_empty(ctx.config.get_string("token").as_deref()))
        .or_else(|| credentials_token(env, host))
}

fn credentials_token(env: &dyn EnvLookup, host: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Credentials {
        #[serde(default)]
        credentials: std::collections::HashMap<String, Credential>,
    }
    #[derive(Deserialize)]
    struct Credential {
        #[serde(default)]
        token: String,
    }

    let path: PathBuf = env.home_dir()?.join(CREDENTIALS_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            debug!("no credentials file at {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice::<Credentials>(&data) {
        Ok(mut creds) => creds.credentials.remove(host).map(|c| c.token).filter(|t| !t.is_empty()),
        Err(e) => {
            warn!("failed to parse credentials file {}: {}", path.display(), e);
            None
        }
    }
}

/// Race `fut` against `cancel` and map failures to user-facing errors.
async fn guarded<T, F>(cancel: &CancellationToken, err_ctx: &ErrorContext, fut: F) -> BackendResult<T>
where
    F: Future<Output = Result<T, ApiError>>,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
        result = fut => result,
    };
    result.map_err(|e| friendly(e, err_ctx))
}

/// Backend over the hosted API.
pub struct RemoteBackend {
    ctx: BackendContext,
    config: RemoteConfig,
    host: String,
    token: Option<String>,
    api: Arc<dyn TfeApi>,
    versions: Option<Vec<RevisionRecord>>,
    runs: Option<Vec<RunRecord>>,
    purged: bool,
}

impl RemoteBackend {
    /// Backend talking to the resolved host over HTTPS.
    pub fn new(ctx: BackendContext, config: RemoteConfig) -> BackendResult<Self> {
        let host = resolve_host(&ctx, &config);
        let token = resolve_token(&ctx, &config, &host);
        let client = HttpTfeClient::new(&host, token, ctx.cancel.clone())?;
        Ok(Self::with_api(ctx, config, Arc::new(client)))
    }

    /// Backend with no pointer file: everything comes from flags and config.
    pub fn naked(ctx: BackendContext) -> BackendResult<Self> {
        Self::new(ctx, RemoteConfig::default())
    }

    /// Backend over a caller-supplied API implementation.
    pub fn with_api(ctx: BackendContext, config: RemoteConfig, api: Arc<dyn TfeApi>) -> Self {
        let host = resolve_host(&ctx, &config);
        let token = resolve_token(&ctx, &config, &host);
        Self {
            ctx,
            config,
            host,
            token,
            api,
            versions: None,
            runs: None,
            purged: false,
        }
    }

    /// Resolved hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved token, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Organization: flag, pointer file, config `org`.
    pub fn organization(&self) -> BackendResult<String> {
        non_empty(self.ctx.flags.org.as_deref())
            .or_else(|| non_empty(self.config.organization.as_deref()))
            .or_else(|| non_empty(self.ctx.config.get_string("org").as_deref()))
            .ok_or(BackendError::OrganizationNotSet)
    }

    /// Workspace: flag, pointer name, pointer prefix plus environment, config
    /// `workspace`.
    pub fn workspace_name(&self) -> BackendResult<String> {
        if let Some(ws) = non_empty(self.ctx.flags.workspace.as_deref()) {
            return Ok(ws);
        }
        let block = self.config.workspaces.clone().unwrap_or_default();
        let name = non_empty(block.name.as_deref());
        let prefix = non_empty(block.prefix.as_deref());
        match (name, prefix) {
            (Some(_), Some(_)) => return Err(BackendError::WorkspaceNameAndPrefix),
            (Some(name), None) => {
                debug!("workspace name: {}", name);
                return Ok(name);
            }
            (None, Some(prefix)) => {
                let name = format!("{}{}", prefix, self.ctx.workspace_env().unwrap_or_default());
                debug!("workspace prefixed name: {}", name);
                return Ok(name);
            }
            (None, None) => {}
        }
        non_empty(self.ctx.config.get_string("workspace").as_deref()).ok_or(BackendError::WorkspaceNotSet)
    }

    fn error_context(&self, workspace: &str, operation: &str) -> ErrorContext {
        let organization = self.organization().unwrap_or_default();
        ErrorContext::new(&self.host, &organization, workspace, operation)
    }

    fn cache_namespace(&self) -> [String; 2] {
        let env = self.ctx.env.as_ref();
        let host = env.var(CACHE_HOST_VAR).unwrap_or_else(|| self.host.clone());
        let org = env
            .var(CACHE_ORG_VAR)
            .unwrap_or_else(|| self.organization().unwrap_or_default());
        [host, org]
    }

    /// The workspace record. Never cached: its current version moves.
    pub async fn workspace(&self) -> BackendResult<WorkspaceRecord> {
        let organization = self.organization()?;
        let name = self.workspace_name()?;
        let err_ctx = self.error_context(&name, "read workspace");
        guarded(&self.ctx.cancel, &err_ctx, self.api.read_workspace(&organization, &name)).await
    }

    /// Workspaces of the organization.
    pub async fn workspaces(
        &self,
        augmenter: Option<&Augmenter<WorkspaceListOptions>>,
    ) -> BackendResult<Vec<WorkspaceRecord>> {
        let organization = self.organization()?;
        let limit = self.ctx.flags.limit;
        let options = WorkspaceListOptions {
            list: ListOptions::for_limit(limit),
            ..Default::default()
        };
        let err_ctx = self.error_context("", "list workspaces");
        let (api, cancel) = (&self.api, &self.ctx.cancel);
        paginate(options, limit, augmenter, |opts| {
            let (organization, err_ctx) = (&organization, &err_ctx);
            async move { guarded(cancel, err_ctx, api.list_workspaces(organization, &opts)).await }
        })
        .await
    }

    async fn current_state_version_id(&self) -> BackendResult<String> {
        let ws = self.workspace().await?;
        ws.current_state_version
            .ok_or(BackendError::NoCurrentStateVersion(ws.id))
    }

    async fn document(&self, record: &RevisionRecord) -> BackendResult<Vec<u8>> {
        match &record.locator {
            Locator::Url(url) => {
                let [host, org] = self.cache_namespace();
                let workspace = self.workspace_name().unwrap_or_default();
                let err_ctx = self.error_context(&workspace, "download state");
                let (api, cancel) = (&self.api, &self.ctx.cancel);
                self.ctx
                    .cache
                    .fetch_through(&[host.as_str(), org.as_str()], url, || async {
                        guarded(cancel, &err_ctx, api.download(url)).await
                    })
                    .await
            }
            Locator::Path(path) => Ok(tokio::fs::read(path).await?),
            Locator::ObjectVersion(_) | Locator::None => Err(BackendError::MissingDocument(record.id.clone())),
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn runs(&mut self) -> BackendResult<Vec<RunRecord>> {
        if let Some(runs) = &self.runs {
            debug!("runs preloaded with {}", runs.len());
            return Ok(runs.clone());
        }
        let organization = self.organization()?;
        let workspace = self.workspace_name()?;
        let limit = self.ctx.flags.limit;
        let options = RunListOptions {
            list: ListOptions::for_limit(limit),
            workspace_names: Some(workspace.clone()),
        };
        let err_ctx = self.error_context(&workspace, "list runs");
        let (api, cancel) = (&self.api, &self.ctx.cancel);
        let runs = paginate(options, limit, None, |opts| {
            let (organization, err_ctx) = (&organization, &err_ctx);
            async move { guarded(cancel, err_ctx, api.list_runs(organization, &opts)).await }
        })
        .await?;
        self.runs = Some(runs.clone());
        Ok(runs)
    }

    async fn states(&mut self, specs: &[String]) -> BackendResult<Vec<Vec<u8>>> {
        let candidates = self.state_versions(None).await?;
        let selected = address::resolve(&candidates, specs)?;
        debug!("resolved {} state versions", selected.len());

        self.ctx.purge_cache_once(&mut self.purged);
        let mut docs = Vec::with_capacity(selected.len());
        for record in &selected {
            docs.push(self.document(record).await?);
        }
        Ok(docs)
    }

    async fn state_versions(
        &mut self,
        augmenter: Option<&StateVersionAugmenter>,
    ) -> BackendResult<Vec<RevisionRecord>> {
        // Only unfiltered listings are memoized.
        if let (None, Some(versions)) = (augmenter, &self.versions) {
            debug!("state versions preloaded with {}", versions.len());
            return Ok(versions.clone());
        }

        let organization = self.organization()?;
        let workspace = self.workspace_name()?;
        let limit = self.ctx.flags.effective_limit();
        let options = StateVersionListOptions {
            list: ListOptions::for_limit(limit),
            organization: organization.clone(),
            workspace: workspace.clone(),
        };
        let err_ctx = self.error_context(&workspace, "list state versions");
        let (api, cancel) = (&self.api, &self.ctx.cancel);
        let mut records = paginate(options, limit, augmenter, |opts| {
            let err_ctx = &err_ctx;
            async move { guarded(cancel, err_ctx, api.list_state_versions(&opts)).await }
        })
        .await?;

        if self.ctx.flags.deep {
            let err_ctx = self.error_context(&workspace, "read state version");
            for record in records.iter_mut() {
                let reread = guarded(cancel, &err_ctx, api.read_state_version(&record.id, &DEEP_INCLUDES)).await;
                match reread {
                    Ok(full) => *record = full,
                    Err(BackendError::Cancelled(op)) => return Err(BackendError::Cancelled(op)),
                    Err(e) => warn!(
                        "failed to read state version (with includes) {}; using list item: {}",
                        record.id, e
                    ),
                }
            }
        }

        sort_newest_first(&mut records);
        if augmenter.is_none() {
            self.versions = Some(records.clone());
        }
        Ok(records)
    }

    /// Resolve one revision record. The current revision is looked up through
    /// the workspace instead of the list; records are cached by id.
    async fn state_version(&mut self, spec: &str) -> BackendResult<RevisionRecord> {
        let id = match RevisionAddress::parse(spec)? {
            _ if spec.is_empty() => self.current_state_version_id().await?,
            RevisionAddress::Offset(0) => self.current_state_version_id().await?,
            addr @ (RevisionAddress::Offset(_) | RevisionAddress::Serial(_)) => {
                let list = self.state_versions(None).await?;
                addr.select(&list)?.id
            }
            RevisionAddress::IdPrefix(p) if p.starts_with("https://") || p.starts_with("http://") => {
                return Err(BackendError::Unsupported {
                    operation: "reading a state version by URL",
                    backend: TYPE_NAME,
                })
            }
            RevisionAddress::IdPrefix(id) => id,
            addr @ RevisionAddress::File(_) => return Ok(addr.select(&[])?),
        };

        let [host, org] = self.cache_namespace();
        let namespace = [host.as_str(), org.as_str()];
        if let Some(entry) = self.ctx.cache.read(&namespace, &id) {
            match serde_json::from_slice::<RevisionRecord>(&entry.data) {
                Ok(record) => return Ok(record),
                Err(e) => debug!("cached state version {} unreadable, refetching: {}", id, e),
            }
        }

        let workspace = self.workspace_name().unwrap_or_default();
        let err_ctx = self.error_context(&workspace, "read state version");
        let record = guarded(&self.ctx.cancel, &err_ctx, self.api.read_state_version(&id, &[])).await?;
        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                if let Err(e) = self.ctx.cache.write(&namespace, &id, &bytes) {
                    warn!("failed to write state version to cache: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize state version {}: {}", id, e),
        }
        Ok(record)
    }

    fn revision_flag(&self) -> String {
        self.ctx.flags.revision.clone()
    }

    fn as_self_differ(&mut self) -> Option<&mut dyn SelfDiffer> {
        Some(self)
    }
}

#[async_trait]
impl SelfDiffer for RemoteBackend {
    async fn diff_states(&mut self, selector: &dyn VersionSelector) -> BackendResult<Option<Vec<Vec<u8>>>> {
        let args = self.ctx.flags.diff_args.clone();
        diff::diff_states(self, &args, selector).await
    }
}

impl fmt::Display for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote: host={} organization={} workspace={} token={}",
            self.host,
            self.organization().unwrap_or_else(|_| "<unset>".to_string()),
            self.workspace_name().unwrap_or_else(|_| "<unset>".to_string()),
            if self.token.is_some() { "********" } else { "<none>" },
        )
    }
}

impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
