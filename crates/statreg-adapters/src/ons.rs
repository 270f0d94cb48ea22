//! Office for National Statistics dataset API (`start`/`limit` paging).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use statreg_core::{
    explode_keywords, normalize_optional, normalize_timestamp, parse_fuzzy_date, CatalogItem,
    ContactDraft, ReleaseInfo,
};
use tracing::warn;
use url::Url;

use crate::{
    json_at, json_bool, json_str, json_string_list, json_usize, AdapterError, CatalogSource,
    FetchedPage, PageCursor,
};

pub const SOURCE_ID: &str = "ons";
pub const DEFAULT_API_URL: &str = "https://api.ons.gov.uk/dataset";
pub const DEFAULT_SITE_URL: &str = "https://www.ons.gov.uk";
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct OnsSource {
    pub api_url: String,
    pub site_url: String,
    pub page_size: usize,
}

impl Default for OnsSource {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[async_trait]
impl CatalogSource for OnsSource {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Offset {
            start: 0,
            limit: self.page_size,
        }
    }

    fn page_url(&self, cursor: &PageCursor) -> Result<String, AdapterError> {
        match cursor {
            PageCursor::Offset { start, limit } => {
                Ok(format!("{}?start={start}&limit={limit}", self.api_url))
            }
            PageCursor::Link(url) => Err(AdapterError::Message(format!(
                "ons paging is offset based; got link cursor {url}"
            ))),
        }
    }

    fn split_page<'a>(
        &self,
        page: &'a FetchedPage,
    ) -> Result<(Vec<&'a JsonValue>, Option<PageCursor>), AdapterError> {
        let items = page
            .body
            .get("items")
            .and_then(JsonValue::as_array)
            .ok_or(AdapterError::MissingField("items"))?;
        let total = json_usize(&page.body, &["totalItems"]).unwrap_or(0);
        let next = match page.cursor {
            PageCursor::Offset { start, limit } if start + limit < total => {
                Some(PageCursor::Offset {
                    start: start + limit,
                    limit,
                })
            }
            _ => None,
        };
        Ok((items.iter().collect(), next))
    }

    fn parse_item(&self, _page_url: &str, raw: &JsonValue) -> Result<CatalogItem, AdapterError> {
        let site = Url::parse(&self.site_url).map_err(|e| AdapterError::MalformedField {
            field: "site_url",
            reason: e.to_string(),
        })?;
        parse_ons_item(&site, raw)
    }
}

/// The dataset URI is the distribution URI with its last path segment removed.
pub fn dataset_uri_for(distribution: &Url) -> String {
    let mut dataset = distribution.clone();
    let path = distribution.path().trim_end_matches('/');
    let parent = match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    };
    dataset.set_path(parent);
    dataset.set_query(None);
    dataset.set_fragment(None);
    dataset.to_string()
}

pub fn parse_ons_item(site: &Url, raw: &JsonValue) -> Result<CatalogItem, AdapterError> {
    let relative = json_str(raw, &["uri"]).ok_or(AdapterError::MissingField("uri"))?;
    let distribution = site
        .join(relative)
        .map_err(|e| AdapterError::MalformedField {
            field: "uri",
            reason: e.to_string(),
        })?;
    let dist_uri = distribution.to_string();
    let desc = json_at(raw, &["description"])
        .filter(|d| d.is_object())
        .ok_or(AdapterError::MissingField("description"))?;

    let release_raw =
        json_str(desc, &["releaseDate"]).ok_or(AdapterError::MissingField("releaseDate"))?;
    let release_date =
        normalize_timestamp(release_raw).map_err(|e| AdapterError::MalformedField {
            field: "releaseDate",
            reason: e.to_string(),
        })?;

    let next_release = normalize_optional(json_str(desc, &["nextRelease"])).and_then(|text| {
        match parse_fuzzy_date(&text) {
            Ok(date) => Some(date),
            Err(err) => {
                warn!(
                    uri = %dist_uri,
                    next_release = %text,
                    error = %err,
                    "unparseable next release; leaving empty"
                );
                None
            }
        }
    });

    let contact = json_at(desc, &["contact"])
        .filter(|c| c.is_object())
        .map(|c| {
            ContactDraft::new(
                json_str(c, &["email"]),
                json_str(c, &["name"]),
                json_str(c, &["telephone"]),
            )
        })
        .filter(|c| *c != ContactDraft::default());

    let version = normalize_optional(json_str(desc, &["versionLabel"]))
        .or_else(|| normalize_optional(json_str(desc, &["version"])));

    Ok(CatalogItem {
        dataset_uri: dataset_uri_for(&distribution),
        source_id: None,
        title: normalize_optional(json_str(desc, &["title"])),
        summary: normalize_optional(json_str(desc, &["summary"])),
        stats_type: None,
        government_name: None,
        release: ReleaseInfo {
            uri: dist_uri,
            release_date,
            next_release,
            national_statistic: json_bool(desc, &["nationalStatistic"]).unwrap_or(false),
            version,
            edition: normalize_optional(json_str(desc, &["edition"])),
        },
        keywords: explode_keywords(json_string_list(desc, &["keywords"])),
        contact,
        organisations_text: None,
        collections: Vec::new(),
    })
}
