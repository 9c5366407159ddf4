//! Sequential page scanning with caller-controlled early exit.
//!
//! A scan fetches one page at a time and hands each page to a visitor. The
//! scan ends when the visitor breaks, a page comes back empty, the page
//! reports no successor, or the page limit is reached.

use std::future::Future;
use std::ops::ControlFlow;

use super::ApiError;

/// One page of results plus the cursor of the page after it
#[derive(Debug, Clone)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    pub next: Option<C>,
}

impl<T> Page<T, u32> {
    /// Page-numbered APIs: a full page implies there may be another one.
    pub fn numbered(items: Vec<T>, page: u32, per_page: usize) -> Self {
        let next = (per_page > 0 && items.len() >= per_page).then_some(page + 1);
        Self { items, next }
    }
}

impl<T> Page<T, usize> {
    /// Offset-based APIs (`$skip`, `skip`): the next offset follows a full page.
    pub fn offset(items: Vec<T>, skip: usize, top: usize) -> Self {
        let next = (top > 0 && items.len() >= top).then_some(skip + items.len());
        Self { items, next }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub pages_fetched: u32,
    /// The visitor asked to stop before the data ran out
    pub stopped_early: bool,
}

/// Fetch pages starting at `first` until the visitor breaks or the data ends.
pub async fn scan_pages<T, C, F, Fut, V>(
    first: C,
    max_pages: u32,
    mut fetch: F,
    mut visit: V,
) -> Result<ScanSummary, ApiError>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<Page<T, C>, ApiError>>,
    V: FnMut(Vec<T>) -> ControlFlow<()>,
{
    let mut cursor = Some(first);
    let mut pages_fetched = 0;

    while let Some(current) = cursor.take() {
        if pages_fetched >= max_pages {
            tracing::debug!("Stopping scan at page limit {}", max_pages);
            break;
        }

        let page = fetch(current).await?;
        pages_fetched += 1;

        if page.items.is_empty() {
            break;
        }

        let next = page.next;
        if visit(page.items).is_break() {
            return Ok(ScanSummary {
                pages_fetched,
                stopped_early: true,
            });
        }
        cursor = next;
    }

    Ok(ScanSummary {
        pages_fetched,
        stopped_early: false,
    })
}

/// Gather up to `limit` items across pages.
pub async fn collect_pages<T, C, F, Fut>(
    first: C,
    max_pages: u32,
    limit: usize,
    fetch: F,
) -> Result<Vec<T>, ApiError>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<Page<T, C>, ApiError>>,
{
    let mut collected = Vec::new();
    if limit == 0 {
        return Ok(collected);
    }

    scan_pages(first, max_pages, fetch, |items| {
        collected.extend(items);
        if collected.len() >= limit {
            collected.truncate(limit);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .await?;

    Ok(collected)
}
