//! Error types for the stateq query engine.

use thiserror::Error;

use crate::address::AddressError;
use crate::decrypt::DecryptError;
use crate::tfe::ApiError;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Error variants surfaced by backends and the factory.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No organization could be resolved from flags, pointer file or config.
    #[error("organization is not set (precedence: --org flag > backend.config.organization > config org)")]
    OrganizationNotSet,

    /// No workspace could be resolved from flags, pointer file or config.
    #[error("workspace is not set (precedence: --workspace flag > backend.config.workspaces > config workspace)")]
    WorkspaceNotSet,

    /// The pointer file declares both a workspace name and a prefix.
    #[error("both workspace name and prefix are set")]
    WorkspaceNameAndPrefix,

    /// The backend pointer file could not be read or parsed.
    #[error("backend pointer file {path}: {reason}")]
    PointerFile {
        /// Path of the pointer file.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// The pointer file names a backend type this engine does not know.
    #[error("unknown backend type {0}")]
    UnknownBackendType(String),

    /// A backend was constructed from a pointer file of another type.
    #[error("backend type is not {expected}: {found}")]
    BackendTypeMismatch {
        /// The type the constructor expected.
        expected: &'static str,
        /// The type found in the pointer file.
        found: String,
    },

    /// The hosted API rejected the token.
    #[error("{operation} on {host}: authentication failed (401). Set {token_var} or TF_TOKEN")]
    Unauthorized {
        /// Operation being attempted.
        operation: String,
        /// Hosted API hostname.
        host: String,
        /// Per-host token environment variable name.
        token_var: String,
    },

    /// The workspace does not exist in the organization.
    #[error("{operation}: workspace {workspace:?} not found in organization {organization:?} on {host} (404)")]
    WorkspaceNotFound {
        /// Operation being attempted.
        operation: String,
        /// Workspace name.
        workspace: String,
        /// Organization name.
        organization: String,
        /// Hosted API hostname.
        host: String,
    },

    /// The organization does not exist on the host.
    #[error("{operation}: organization {organization:?} not found on {host} (404)")]
    OrganizationNotFound {
        /// Operation being attempted.
        operation: String,
        /// Organization name.
        organization: String,
        /// Hosted API hostname.
        host: String,
    },

    /// Any other hosted API failure, with request context attached.
    #[error("{operation} on {host} for org={organization:?} workspace={workspace:?}: {source}")]
    Api {
        /// Operation being attempted.
        operation: String,
        /// Hosted API hostname.
        host: String,
        /// Organization name.
        organization: String,
        /// Workspace name.
        workspace: String,
        /// Underlying API error.
        #[source]
        source: ApiError,
    },

    /// The workspace has no current state version.
    #[error("workspace {0} has no current state version")]
    NoCurrentStateVersion(String),

    /// The revision record does not say where its document lives.
    #[error("state version {0} has no downloadable document")]
    MissingDocument(String),

    /// Object store request failed.
    #[error("object store {operation} failed for s3://{bucket}/{key}: {reason}")]
    ObjectStore {
        /// Operation being attempted.
        operation: &'static str,
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Description of the failure.
        reason: String,
    },

    /// The operation is not available on this backend.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// Operation being attempted.
        operation: &'static str,
        /// Backend type name.
        backend: &'static str,
    },

    /// The caller cancelled the query.
    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),

    /// A revision address could not be resolved.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// An encrypted state document could not be decrypted.
    #[error("failed to decrypt: {0}")]
    Decrypt(#[from] DecryptError),

    /// Unwrapped hosted API error.
    #[error(transparent)]
    Transport(#[from] ApiError),

    /// Configuration file could not be loaded.
    #[error("config {path}: {reason}")]
    Config {
        /// Path of the configuration file.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
