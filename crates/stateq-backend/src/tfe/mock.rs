//! In-memory [`TfeApi`] for tests and offline use.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApiError, RunListOptions, StateVersionListOptions, TfeApi, WorkspaceListOptions};
use crate::paginate::{ListOptions, Page, Pagination};
use crate::revision::{Locator, RevisionRecord, RunRecord, WorkspaceRecord};

/// Call counters for [`MockTfeApi`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockTfeApiStats {
    /// State version list pages served.
    pub list_state_versions: u64,
    /// Single state version reads.
    pub read_state_version: u64,
    /// Run list pages served.
    pub list_runs: u64,
    /// Workspace list pages served.
    pub list_workspaces: u64,
    /// Workspace reads.
    pub read_workspace: u64,
    /// Document downloads.
    pub downloads: u64,
    /// Page size of every list request, in order.
    pub page_sizes: Vec<u32>,
}

/// Hosted API fake holding a single workspace's history.
#[derive(Debug, Default)]
pub struct MockTfeApi {
    state_versions: Vec<RevisionRecord>,
    documents: HashMap<String, Vec<u8>>,
    runs: Vec<RunRecord>,
    workspaces: Vec<WorkspaceRecord>,
    unauthorized: bool,
    hang_downloads: bool,
    stats: Mutex<MockTfeApiStats>,
}

impl MockTfeApi {
    /// An empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a state version with a downloadable body. Versions must be added
    /// newest first.
    pub fn with_state_version(mut self, mut record: RevisionRecord, body: impl Into<Vec<u8>>) -> Self {
        let url = format!("https://mock.invalid/state/{}", record.id);
        record.locator = Locator::Url(url.clone());
        self.documents.insert(url, body.into());
        self.state_versions.push(record);
        self
    }

    /// Add a run.
    pub fn with_run(mut self, run: RunRecord) -> Self {
        self.runs.push(run);
        self
    }

    /// Add a workspace.
    pub fn with_workspace(mut self, workspace: WorkspaceRecord) -> Self {
        self.workspaces.push(workspace);
        self
    }

    /// Answer every call with 401.
    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    /// Never complete document downloads.
    pub fn hanging_downloads(mut self) -> Self {
        self.hang_downloads = true;
        self
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> MockTfeApiStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, update: impl FnOnce(&mut MockTfeApiStats)) -> Result<(), ApiError> {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
        if self.unauthorized {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }
}

fn page_of<T: Clone>(items: &[T], list: &ListOptions) -> Page<T> {
    let size = list.page_size.max(1) as usize;
    let start = (list.page_number.max(1) as usize - 1) * size;
    let end = (start + size).min(items.len());
    let slice = items.get(start..end).unwrap_or_default().to_vec();
    Page {
        items: slice,
        pagination: Pagination {
            current_page: list.page_number,
            next_page: (end < items.len()).then_some(list.page_number + 1),
            total_count: items.len() as u64,
        },
    }
}

#[async_trait]
impl TfeApi for MockTfeApi {
    async fn list_state_versions(
        &self,
        options: &StateVersionListOptions,
    ) -> Result<Page<RevisionRecord>, ApiError> {
        self.record(|s| {
            s.list_state_versions += 1;
            s.page_sizes.push(options.list.page_size);
        })?;
        debug!("mock list_state_versions: page={}", options.list.page_number);
        Ok(page_of(&self.state_versions, &options.list))
    }

    async fn read_state_version(&self, id: &str, includes: &[&str]) -> Result<RevisionRecord, ApiError> {
        self.record(|s| s.read_state_version += 1)?;
        let mut record = self
            .state_versions
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(ApiError::NotFound)?;
        if !includes.is_empty() {
            record.detail = Some(serde_json::json!({ "included": includes }));
        }
        Ok(record)
    }

    async fn list_runs(&self, _organization: &str, options: &RunListOptions) -> Result<Page<RunRecord>, ApiError> {
        self.record(|s| {
            s.list_runs += 1;
            s.page_sizes.push(options.list.page_size);
        })?;
        Ok(page_of(&self.runs, &options.list))
    }

    async fn list_workspaces(
        &self,
        _organization: &str,
        options: &WorkspaceListOptions,
    ) -> Result<Page<WorkspaceRecord>, ApiError> {
        self.record(|s| {
            s.list_workspaces += 1;
            s.page_sizes.push(options.list.page_size);
        })?;
        let matching: Vec<_> = self
            .workspaces
            .iter()
            .filter(|w| options.search.as_deref().map_or(true, |q| w.name.contains(q)))
            .cloned()
            .collect();
        Ok(page_of(&matching, &options.list))
    }

    async fn read_workspace(&self, _organization: &str, name: &str) -> Result<WorkspaceRecord, ApiError> {
        self.record(|s| s.read_workspace += 1)?;
        if let Some(ws) = self.workspaces.iter().find(|w| w.name == name) {
            return Ok(ws.clone());
        }
        // A workspace nobody registered still reports its newest version as current.
        Ok(WorkspaceRecord {
            id: format!("ws-{name}"),
            name: name.to_string(),
            current_state_version: self.state_versions.first().map(|r| r.id.clone()),
            detail: None,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        self.record(|s| s.downloads += 1)?;
        if self.hang_downloads {
            std::future::pending::<()>().await;
        }
        self.documents.get(url).cloned().ok_or(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_page_of() {
        let items: Vec<u32> = (0..5).collect();
        let list = ListOptions {
            page_number: 2,
            page_size: 2,
        };
        let page = page_of(&items, &list);
        assert_eq!(page.items, [2, 3]);
        assert_eq!(page.pagination.next_page, Some(3));

        let last = page_of(&items, &ListOptions { page_number: 3, page_size: 2 });
        assert_eq!(last.items, [4]);
        assert_eq!(last.pagination.next_page, None);

        let past = page_of(&items, &ListOptions { page_number: 9, page_size: 2 });
        assert!(past.items.is_empty());
    }

    #[tokio::test]
    async fn test_download_and_stats() {
        let api = MockTfeApi::new().with_state_version(
            RevisionRecord::new("sv-1", Utc::now(), 1, Locator::None),
            b"{\"serial\":1}".to_vec(),
        );
        let url = "https://mock.invalid/state/sv-1";
        assert_eq!(api.download(url).await.unwrap(), b"{\"serial\":1}");
        assert!(matches!(api.download("https://nope").await, Err(ApiError::NotFound)));
        assert_eq!(api.stats().downloads, 2);
    }
}
