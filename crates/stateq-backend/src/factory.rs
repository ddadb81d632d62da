//! Choosing and building the backend for a working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::cloud::CloudConfig;
use crate::context::{BackendContext, ENVIRONMENT_FILE};
use crate::error::{BackendError, BackendResult};
use crate::local::{LocalBackend, LocalConfig, STATE_FILE};
use crate::object_store::{ObjectStoreBackend, ObjectStoreConfig, S3VersionStore};
use crate::remote::{RemoteBackend, RemoteConfig};

/// Backend pointer file written by `terraform init`.
pub const POINTER_FILE: &str = ".terraform/terraform.tfstate";

/// What the marker files in a working directory say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    /// No markers at all: a bare hosted API query.
    Naked,
    /// State files without a pointer file: an implicit local backend.
    Local,
    /// A pointer file names the backend.
    Pointer,
}

/// Inspect the marker files under `root`.
pub fn detect(root: &Path) -> Detected {
    let pointer = root.join(POINTER_FILE).exists();
    let state = root.join(STATE_FILE).exists();
    let environment = root.join(ENVIRONMENT_FILE).exists();
    debug!(
        "markers in {}: pointer={} state={} environment={}",
        root.display(),
        pointer,
        state,
        environment
    );
    match (pointer, state || environment) {
        (true, _) => Detected::Pointer,
        (false, true) => Detected::Local,
        (false, false) => Detected::Naked,
    }
}

/// `backend` block of the pointer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointerBackend {
    /// Backend type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Configuration hash.
    #[serde(default)]
    pub hash: Option<u64>,
}

/// Parsed backend pointer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendPointer {
    /// Pointer file format version.
    #[serde(default)]
    pub version: u32,
    /// Version of the tool that wrote the file.
    #[serde(default)]
    pub terraform_version: String,
    /// Backend block.
    pub backend: PointerBackend,
    #[serde(skip)]
    path: PathBuf,
}

impl BackendPointer {
    /// Read the pointer file under `root`.
    pub fn load(root: &Path) -> BackendResult<Self> {
        let path = root.join(POINTER_FILE);
        let fail = |reason: String| BackendError::PointerFile {
            path: path.display().to_string(),
            reason,
        };
        let data = std::fs::read(&path).map_err(|e| fail(e.to_string()))?;
        let mut pointer: Self = serde_json::from_slice(&data).map_err(|e| fail(e.to_string()))?;
        debug!(
            "pointer file {}: type={} version={}",
            path.display(),
            pointer.backend.kind,
            pointer.version
        );
        pointer.path = path;
        Ok(pointer)
    }

    /// Backend type named by the pointer.
    pub fn kind(&self) -> &str {
        &self.backend.kind
    }

    /// Parse the backend configuration, checking the type discriminator.
    pub fn config<T: DeserializeOwned>(&self, expected: &'static str) -> BackendResult<T> {
        if self.backend.kind != expected {
            return Err(BackendError::BackendTypeMismatch {
                expected,
                found: self.backend.kind.clone(),
            });
        }
        let config = match &self.backend.config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(config).map_err(|e| BackendError::PointerFile {
            path: self.path.display().to_string(),
            reason: format!("invalid {expected} config: {e}"),
        })
    }
}

/// Build the backend serving `ctx.root_dir`.
pub async fn new_backend(ctx: BackendContext) -> BackendResult<Box<dyn Backend>> {
    match detect(&ctx.root_dir) {
        Detected::Naked => Ok(Box::new(RemoteBackend::naked(ctx)?)),
        Detected::Local => Ok(Box::new(LocalBackend::new(ctx, LocalConfig::default()))),
        Detected::Pointer => {
            let pointer = BackendPointer::load(&ctx.root_dir)?;
            match pointer.kind() {
                "cloud" => {
                    let (ctx, remote) = pointer.config::<CloudConfig>("cloud")?.into_remote(ctx);
                    Ok(Box::new(RemoteBackend::new(ctx, remote)?))
                }
                "local" => Ok(Box::new(LocalBackend::new(ctx, pointer.config("local")?))),
                "remote" => Ok(Box::new(RemoteBackend::new(ctx, pointer.config("remote")?)?)),
                "s3" => {
                    let config: ObjectStoreConfig = pointer.config("s3")?;
                    let store = S3VersionStore::new(config.region.as_deref()).await;
                    Ok(Box::new(ObjectStoreBackend::new(ctx, config, Arc::new(store))))
                }
                other => Err(BackendError::UnknownBackendType(other.to_string())),
            }
        }
    }
}

/// Hosted API backend for organization-level queries. Uses the pointer
/// file when it names a hosted backend and falls back to a naked backend
/// otherwise.
pub fn new_remote_backend(ctx: BackendContext) -> BackendResult<RemoteBackend> {
    if detect(&ctx.root_dir) != Detected::Pointer {
        return RemoteBackend::naked(ctx);
    }
    let pointer = BackendPointer::load(&ctx.root_dir)?;
    match pointer.kind() {
        "remote" => RemoteBackend::new(ctx, pointer.config::<RemoteConfig>("remote")?),
        "cloud" => {
            let (ctx, remote) = pointer.config::<CloudConfig>("cloud")?.into_remote(ctx);
            RemoteBackend::new(ctx, remote)
        }
        other => {
            debug!("pointer names a {} backend; using a naked remote backend", other);
            RemoteBackend::naked(ctx)
        }
    }
}
