//! Fetch loop that keeps paging only while pages keep producing changes.
//!
//! Sources are assumed to list items newest first, so a page with nothing fresh means the
//! rest of the catalog was synced by an earlier run. A source that reorders or interleaves
//! old and new items can have updates missed by this rule.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use statreg_adapters::{AdapterContext, CatalogPage, CatalogSource, PageCursor};
use statreg_storage::HttpFetcher;
use tracing::info;

use crate::resolver::{ResolveOutcome, Resolver};
use crate::store::CatalogStore;

/// Anything that can hand out normalized pages by cursor.
#[async_trait]
pub trait PageFeed: Send {
    fn first_cursor(&self) -> PageCursor;

    async fn fetch(&mut self, cursor: &PageCursor) -> Result<CatalogPage>;
}

/// Pages fetched over HTTP and normalized by a catalog adapter.
pub struct SourceFeed<'a> {
    source: &'a dyn CatalogSource,
    http: &'a HttpFetcher,
    ctx: AdapterContext,
}

impl<'a> SourceFeed<'a> {
    pub fn new(source: &'a dyn CatalogSource, http: &'a HttpFetcher, ctx: AdapterContext) -> Self {
        Self { source, http, ctx }
    }
}

#[async_trait]
impl<'a> PageFeed for SourceFeed<'a> {
    fn first_cursor(&self) -> PageCursor {
        self.source.first_cursor()
    }

    async fn fetch(&mut self, cursor: &PageCursor) -> Result<CatalogPage> {
        let source_id = self.source.source_id();
        let page = self
            .source
            .fetch_page(self.http, &self.ctx, cursor)
            .await
            .with_context(|| format!("fetching {source_id} page at {cursor:?}"))?;
        self.source
            .parse_page(&page)
            .with_context(|| format!("parsing {source_id} page {}", page.url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationState {
    Fetching(PageCursor),
    Terminated,
}

/// Continue only when the page changed something and the source offers another page.
pub fn next_state(page_was_fresh: bool, next: Option<PageCursor>) -> PaginationState {
    match next {
        Some(cursor) if page_was_fresh => PaginationState::Fetching(cursor),
        _ => PaginationState::Terminated,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageTally {
    pub pages_fetched: usize,
    pub items_seen: usize,
    pub items_skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl PageTally {
    fn record(&mut self, outcome: ResolveOutcome) {
        self.items_seen += 1;
        match outcome {
            ResolveOutcome::Created => self.created += 1,
            ResolveOutcome::Updated => self.updated += 1,
            ResolveOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    state: PaginationState,
    tally: PageTally,
}

impl PaginationController {
    pub fn new(first: PageCursor) -> Self {
        Self {
            state: PaginationState::Fetching(first),
            tally: PageTally::default(),
        }
    }

    pub fn state(&self) -> &PaginationState {
        &self.state
    }

    pub fn tally(&self) -> PageTally {
        self.tally
    }

    /// Fetches and resolves pages until the feed runs dry or a page brings nothing fresh.
    ///
    /// Each item is resolved in its own transaction; a store error aborts the run with
    /// earlier items committed.
    pub async fn run<F>(
        feed: &mut F,
        store: &CatalogStore,
        resolver: &mut Resolver,
    ) -> Result<PageTally>
    where
        F: PageFeed + ?Sized,
    {
        let mut controller = Self::new(feed.first_cursor());
        while let PaginationState::Fetching(cursor) = controller.state.clone() {
            let page = feed.fetch(&cursor).await?;
            controller.tally.pages_fetched += 1;
            controller.tally.items_skipped += page.skipped;

            let mut fresh = false;
            for item in &page.items {
                let mut tx = store
                    .pool()
                    .begin()
                    .await
                    .context("starting item transaction")?;
                let outcome = resolver
                    .resolve(&mut *tx, item)
                    .await
                    .with_context(|| format!("resolving {}", item.dataset_uri))?;
                tx.commit()
                    .await
                    .with_context(|| format!("committing {}", item.dataset_uri))?;
                controller.tally.record(outcome);
                fresh |= outcome.is_fresh();
            }

            info!(
                page = controller.tally.pages_fetched,
                items = page.items.len(),
                skipped = page.skipped,
                fresh,
                "page processed"
            );
            controller.state = next_state(fresh, page.next);
        }
        Ok(controller.tally)
    }
}
