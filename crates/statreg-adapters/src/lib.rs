//! Catalog source contracts + the ONS and GOV.UK statistics adapters.

pub mod directory;
pub mod ons;
pub mod whitehall;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use statreg_core::CatalogItem;
use statreg_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use directory::{label_appears_in, OrganisationDirectory, OrganisationEntry};
pub use ons::OnsSource;
pub use whitehall::WhitehallSource;

pub const CRATE_NAME: &str = "statreg-adapters";

/// Position of the next page to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageCursor {
    /// `start`/`limit` query parameters against a `totalItems` envelope.
    Offset { start: usize, limit: usize },
    /// A continuation URL handed back by the previous page.
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub cursor: PageCursor,
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// One page of normalized items plus where to go next, if anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    /// Raw records dropped because they were structurally unusable.
    pub skipped: usize,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("item is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is malformed: {reason}")]
    MalformedField { field: &'static str, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn first_cursor(&self) -> PageCursor;

    fn page_url(&self, cursor: &PageCursor) -> Result<String, AdapterError>;

    /// Normalizes one raw record; errors here drop only this record.
    fn parse_item(&self, page_url: &str, raw: &JsonValue) -> Result<CatalogItem, AdapterError>;

    /// Raw records of a page plus the cursor for the following page.
    fn split_page<'a>(
        &self,
        page: &'a FetchedPage,
    ) -> Result<(Vec<&'a JsonValue>, Option<PageCursor>), AdapterError>;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: &PageCursor,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.page_url(cursor)?;
        let body = http.get_json(ctx.run_id, &url).await?;
        Ok(FetchedPage {
            url,
            cursor: cursor.clone(),
            body,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<CatalogPage, AdapterError> {
        let (records, next) = self.split_page(page)?;
        let mut items = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for raw in records {
            match self.parse_item(&page.url, raw) {
                Ok(item) => items.push(item),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        source = self.source_id(),
                        page = %page.url,
                        error = %err,
                        "skipping malformed item"
                    );
                }
            }
        }
        Ok(CatalogPage {
            items,
            skipped,
            next,
        })
    }
}

/// Loads a captured listing page from disk, as used by the fixture tests.
pub fn load_fixture_page(
    path: impl AsRef<Path>,
    url: &str,
    cursor: PageCursor,
) -> Result<FetchedPage> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let body = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(FetchedPage {
        url: url.to_string(),
        cursor,
        body,
    })
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path)?.as_bool()
}

pub(crate) fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_at(value, path)?;
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn json_usize(value: &JsonValue, path: &[&str]) -> Option<usize> {
    json_at(value, path)?.as_u64().and_then(|n| usize::try_from(n).ok())
}

/// String entries of an array, or a lone string as a one-element list.
pub(crate) fn json_string_list(value: &JsonValue, path: &[&str]) -> Vec<String> {
    match json_at(value, path) {
        Some(JsonValue::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        Some(JsonValue::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}
