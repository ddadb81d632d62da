//! Generic page walking for hosted API list endpoints.
//!
//! Every list call in the hosted API takes a page number and page size and
//! answers with the next page number, if any. [`paginate`] drives that loop
//! for any options type implementing [`Paginated`], running the caller's
//! [`Augmenter`] before each page request.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BackendResult;

/// Largest page size the hosted API accepts.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Page number and size shared by every list request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// One-based page number.
    pub page_number: u32,
    /// Items per page.
    pub page_size: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: MAX_PAGE_SIZE,
        }
    }
}

impl ListOptions {
    /// Options for the first page with a size fitted to `limit`.
    pub fn for_limit(limit: Option<usize>) -> Self {
        Self {
            page_number: 1,
            page_size: page_size_for(limit),
        }
    }
}

/// `min(limit, 100)`, or 100 when there is no limit.
pub fn page_size_for(limit: Option<usize>) -> u32 {
    match limit.filter(|l| *l > 0) {
        Some(l) => u32::try_from(l).map_or(MAX_PAGE_SIZE, |l| l.min(MAX_PAGE_SIZE)),
        None => MAX_PAGE_SIZE,
    }
}

/// Options types that carry [`ListOptions`].
pub trait Paginated {
    /// Embedded page options.
    fn list_options(&self) -> &ListOptions;

    /// Mutable embedded page options.
    fn list_options_mut(&mut self) -> &mut ListOptions;

    /// Current page number.
    fn page_number(&self) -> u32 {
        self.list_options().page_number
    }

    /// Move to page `n`.
    fn set_page_number(&mut self, n: u32) {
        self.list_options_mut().page_number = n;
    }
}

impl Paginated for ListOptions {
    fn list_options(&self) -> &ListOptions {
        self
    }

    fn list_options_mut(&mut self) -> &mut ListOptions {
        self
    }
}

/// Pagination metadata returned with each page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Pagination {
    /// Page this response covers.
    #[serde(default)]
    pub current_page: u32,
    /// Next page, `None` on the last page.
    #[serde(default)]
    pub next_page: Option<u32>,
    /// Total items across all pages.
    #[serde(default)]
    pub total_count: u64,
}

/// One page of a list response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Position of this page.
    pub pagination: Pagination,
}

/// Mutates list options before every page request.
pub type Augmenter<O> = dyn Fn(&mut O) -> BackendResult<()> + Send + Sync;

/// Fetch pages until `limit` items are collected or the last page is seen.
///
/// The augmenter runs before every page, including the first. A limit of
/// `None` or `Some(0)` collects everything.
pub async fn paginate<O, T, F, Fut>(
    mut options: O,
    limit: Option<usize>,
    augmenter: Option<&Augmenter<O>>,
    mut fetch: F,
) -> BackendResult<Vec<T>>
where
    O: Paginated + Clone,
    F: FnMut(O) -> Fut,
    Fut: Future<Output = BackendResult<Page<T>>>,
{
    let limit = limit.filter(|l| *l > 0);
    let mut items = Vec::new();

    loop {
        if let Some(augment) = augmenter {
            augment(&mut options)?;
        }
        let page = fetch(options.clone()).await?;
        debug!(
            "fetched page {} ({} items, next={:?})",
            options.page_number(),
            page.items.len(),
            page.pagination.next_page
        );
        items.extend(page.items);

        if let Some(limit) = limit {
            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
        }
        match page.pagination.next_page {
            Some(next) if next > options.page_number() => options.set_page_number(next),
            _ => break,
        }
    }

    Ok(items)
}
