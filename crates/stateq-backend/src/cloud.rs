//! `cloud` pointer blocks.
//!
//! A cloud block names the same hosted API as a remote block with a slightly
//! different shape. It is never queried directly: [`CloudConfig::into_remote`]
//! rewrites it into a [`RemoteConfig`] and the remote backend takes over.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::BackendContext;
use crate::remote::{RemoteConfig, WorkspacesBlock};

/// `workspaces` block of a cloud configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudWorkspaces {
    /// Workspace name.
    #[serde(default)]
    pub name: Option<String>,
    /// Project the workspace belongs to.
    #[serde(default)]
    pub project: Option<String>,
}

/// Cloud backend configuration as recorded in the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Hosted API hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Organization name.
    #[serde(default)]
    pub organization: Option<String>,
    /// API token.
    #[serde(default)]
    pub token: Option<serde_json::Value>,
    /// Workspace selection.
    #[serde(default)]
    pub workspaces: Option<CloudWorkspaces>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl CloudConfig {
    /// Rewrite into a remote configuration.
    ///
    /// The block's host wins over `--host`. `--org` wins over the block only
    /// when it differs from the configured default organization, so a config
    /// file default never overrides what the working directory declares. The
    /// host and organization flags are consumed here.
    pub fn into_remote(self, mut ctx: BackendContext) -> (BackendContext, RemoteConfig) {
        let flag_host = non_empty(ctx.flags.host.take());
        let flag_org = non_empty(ctx.flags.org.take());
        let config_org = non_empty(ctx.config.get_string("org"));

        let hostname = non_empty(self.hostname).or(flag_host);
        let block_org = non_empty(self.organization);
        let organization = match flag_org {
            Some(flag) if Some(&flag) != config_org.as_ref() => Some(flag),
            flag => block_org.or(flag).or(config_org),
        };

        let workspaces = self.workspaces.unwrap_or_default();
        if let Some(project) = workspaces.project.as_deref() {
            debug!("cloud workspace project: {}", project);
        }

        let remote = RemoteConfig {
            hostname,
            organization,
            token: self.token,
            workspaces: Some(WorkspacesBlock {
                name: workspaces.name,
                prefix: None,
            }),
        };
        (ctx, remote)
    }
}
