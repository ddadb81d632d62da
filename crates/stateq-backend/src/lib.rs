#![warn(missing_docs)]

//! stateq query engine: one backend contract over hosted API, local, object store and cloud state storage

pub mod address;
pub mod backend;
pub mod cache;
pub mod cloud;
pub mod config;
pub mod context;
pub mod decrypt;
pub mod diff;
pub mod env;
pub mod error;
pub mod factory;
pub mod local;
pub mod object_store;
pub mod paginate;
pub mod remote;
pub mod revision;
pub mod tfe;

pub use backend::{Backend, SelfDiffer, VersionSelector};
pub use context::{BackendContext, QueryFlags};
pub use error::{BackendError, BackendResult};
pub use factory::{new_backend, new_remote_backend};
pub use revision::{Locator, RevisionRecord, RunRecord, WorkspaceRecord};
