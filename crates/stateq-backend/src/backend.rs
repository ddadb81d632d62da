//! The backend contract every state storage location implements.

use std::fmt;

use async_trait::async_trait;

use crate::address::{self, AddressError};
use crate::error::{BackendError, BackendResult};
use crate::paginate::Augmenter;
use crate::revision::{RevisionRecord, RunRecord};
use crate::tfe::StateVersionListOptions;

/// Caller hook run before each state version page request.
pub type StateVersionAugmenter = Augmenter<StateVersionListOptions>;

/// A state storage location that can be queried for revisions.
///
/// Revision lists are ordered newest first. Unfiltered lists are memoized
/// per instance, so a backend is cheap to query repeatedly within one
/// command; a listing with an augmenter always goes to the source.
#[async_trait]
pub trait Backend: fmt::Display + Send + Sync {
    /// Short type name: `remote`, `local` or `s3`.
    fn type_name(&self) -> &'static str;

    /// Run history of the backing workspace.
    async fn runs(&mut self) -> BackendResult<Vec<RunRecord>>;

    /// The document addressed by the revision flag.
    async fn state(&mut self) -> BackendResult<Vec<u8>> {
        let revision = self.revision_flag();
        self.states(&[revision])
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::Address(AddressError::OffsetOutOfRange { index: 0, len: 0 }))
    }

    /// Documents for each revision address, in order.
    async fn states(&mut self, specs: &[String]) -> BackendResult<Vec<Vec<u8>>>;

    /// Revision records, newest first.
    async fn state_versions(
        &mut self,
        augmenter: Option<&StateVersionAugmenter>,
    ) -> BackendResult<Vec<RevisionRecord>>;

    /// The single record `spec` addresses.
    async fn state_version(&mut self, spec: &str) -> BackendResult<RevisionRecord> {
        let records = self.state_versions(None).await?;
        address::resolve(&records, &[spec])?
            .into_iter()
            .next()
            .ok_or(BackendError::Address(AddressError::OffsetOutOfRange { index: 0, len: 0 }))
    }

    /// Revision address requested on the command line.
    fn revision_flag(&self) -> String;

    /// Self-diff capability, when the backend has one.
    fn as_self_differ(&mut self) -> Option<&mut dyn SelfDiffer> {
        None
    }
}

/// Picks revisions interactively for `--diff +`.
pub trait VersionSelector: Send + Sync {
    /// Return the chosen records. Zero means the user cancelled.
    fn select(&self, records: &[RevisionRecord]) -> Vec<RevisionRecord>;
}

/// Backends that can produce two of their own revisions for comparison.
#[async_trait]
pub trait SelfDiffer: Send {
    /// The two documents to compare, older first. `None` when there is
    /// nothing to compare.
    async fn diff_states(&mut self, selector: &dyn VersionSelector) -> BackendResult<Option<Vec<Vec<u8>>>>;
}
