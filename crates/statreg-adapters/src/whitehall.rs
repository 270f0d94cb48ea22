//! GOV.UK statistics publications listing (`next_page_url` paging).

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use statreg_core::{
    normalize_optional, normalize_timestamp, CatalogItem, CollectionRef, ReleaseInfo, StatsType,
};
use url::Url;

use crate::{json_at, json_i64, json_str, AdapterError, CatalogSource, FetchedPage, PageCursor};

pub const SOURCE_ID: &str = "whitehall";
pub const DEFAULT_LISTING_URL: &str = "https://www.gov.uk/government/statistics.json";

const COLLECTION_MARKER: &str = "Part of a collection";

#[derive(Debug, Clone)]
pub struct WhitehallSource {
    pub listing_url: String,
}

impl Default for WhitehallSource {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
        }
    }
}

#[async_trait]
impl CatalogSource for WhitehallSource {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Link(self.listing_url.clone())
    }

    fn page_url(&self, cursor: &PageCursor) -> Result<String, AdapterError> {
        match cursor {
            PageCursor::Link(url) => Ok(url.clone()),
            PageCursor::Offset { .. } => Err(AdapterError::Message(
                "whitehall paging follows next_page_url links".to_string(),
            )),
        }
    }

    fn split_page<'a>(
        &self,
        page: &'a FetchedPage,
    ) -> Result<(Vec<&'a JsonValue>, Option<PageCursor>), AdapterError> {
        let results = page
            .body
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or(AdapterError::MissingField("results"))?;
        let next = match json_str(&page.body, &["next_page_url"]) {
            Some(next) if !next.trim().is_empty() => {
                Some(PageCursor::Link(join_url(&page.url, next.trim(), "next_page_url")?))
            }
            _ => None,
        };
        Ok((results.iter().collect(), next))
    }

    fn parse_item(&self, page_url: &str, raw: &JsonValue) -> Result<CatalogItem, AdapterError> {
        parse_whitehall_item(page_url, raw)
    }
}

pub fn parse_whitehall_item(page_url: &str, raw: &JsonValue) -> Result<CatalogItem, AdapterError> {
    // Listing rows wrap the publication in a `result` object.
    let res = json_at(raw, &["result"]).unwrap_or(raw);

    let url = json_str(res, &["url"]).ok_or(AdapterError::MissingField("url"))?;
    let landing_page = join_url(page_url, url, "url")?;

    let issued_raw =
        json_str(res, &["public_timestamp"]).ok_or(AdapterError::MissingField("public_timestamp"))?;
    let issued = normalize_timestamp(issued_raw).map_err(|e| AdapterError::MalformedField {
        field: "public_timestamp",
        reason: e.to_string(),
    })?;

    let stats_type = json_str(res, &["display_type"]).and_then(StatsType::from_display);
    let collections = match json_str(res, &["publication_collections"]) {
        Some(fragment) => parse_collections(page_url, fragment)?,
        None => Vec::new(),
    };

    Ok(CatalogItem {
        dataset_uri: landing_page.clone(),
        source_id: json_i64(res, &["id"]),
        title: normalize_optional(json_str(res, &["title"])),
        summary: normalize_optional(json_str(res, &["summary"])),
        stats_type,
        government_name: normalize_optional(json_str(res, &["government_name"])),
        release: ReleaseInfo {
            uri: landing_page,
            release_date: issued,
            next_release: None,
            national_statistic: stats_type == Some(StatsType::NationalStatistics),
            version: None,
            edition: None,
        },
        keywords: Vec::new(),
        contact: None,
        organisations_text: normalize_optional(json_str(res, &["organisations"])),
        collections,
    })
}

/// Collection links from a `publication_collections` HTML fragment.
///
/// Only fragments announcing "Part of a collection" are considered.
pub fn parse_collections(base: &str, fragment: &str) -> Result<Vec<CollectionRef>, AdapterError> {
    let html = Html::parse_fragment(fragment);
    let text = html.root_element().text().collect::<String>();
    if !text.contains(COLLECTION_MARKER) {
        return Ok(Vec::new());
    }
    let sel = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;
    let mut out: Vec<CollectionRef> = Vec::new();
    for link in html.select(&sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Ok(uri) = join_url(base, href.trim(), "publication_collections") else {
            continue;
        };
        if out.iter().any(|c| c.uri == uri) {
            continue;
        }
        out.push(CollectionRef {
            uri,
            label: normalize_optional(Some(&link.text().collect::<String>())),
        });
    }
    Ok(out)
}

fn join_url(base: &str, reference: &str, field: &'static str) -> Result<String, AdapterError> {
    let base = Url::parse(base).map_err(|e| AdapterError::MalformedField {
        field,
        reason: format!("base {base}: {e}"),
    })?;
    base.join(reference)
        .map(|u| u.to_string())
        .map_err(|e| AdapterError::MalformedField {
            field,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn sample_row() -> JsonValue {
        json!({
            "result": {
                "id": 1234567,
                "title": "Schools, pupils and their characteristics: January 2021",
                "url": "/government/statistics/schools-pupils-and-their-characteristics-january-2021",
                "organisations": "<abbr title=\"Department for Education\">DfE</abbr>",
                "display_type": "National Statistics",
                "public_timestamp": "2021-06-10T09:30:00.000+01:00",
                "government_name": "2019 Conservative government",
                "publication_collections": "Part of a collection: <a href=\"/government/collections/statistics-school-and-pupil-numbers\">Statistics: school and pupil numbers</a>"
            }
        })
    }

    #[test]
    fn normalizes_listing_row() {
        let item = parse_whitehall_item(DEFAULT_LISTING_URL, &sample_row()).unwrap();
        assert_eq!(
            item.dataset_uri,
            "https://www.gov.uk/government/statistics/schools-pupils-and-their-characteristics-january-2021"
        );
        assert_eq!(item.source_id, Some(1234567));
        assert_eq!(item.stats_type, Some(StatsType::NationalStatistics));
        assert!(item.release.national_statistic);
        assert_eq!(
            item.release.release_date,
            NaiveDate::from_ymd_opt(2021, 6, 10).unwrap().and_hms_opt(8, 30, 0).unwrap()
        );
        assert_eq!(
            item.organisations_text.as_deref(),
            Some("<abbr title=\"Department for Education\">DfE</abbr>")
        );
        assert_eq!(
            item.collections,
            vec![CollectionRef {
                uri: "https://www.gov.uk/government/collections/statistics-school-and-pupil-numbers"
                    .to_string(),
                label: Some("Statistics: school and pupil numbers".to_string()),
            }]
        );
    }

    #[test]
    fn unknown_display_type_is_absent() {
        let mut row = sample_row();
        row["result"]["display_type"] = json!("Research and analysis");
        let item = parse_whitehall_item(DEFAULT_LISTING_URL, &row).unwrap();
        assert_eq!(item.stats_type, None);
        assert!(!item.release.national_statistic);
    }

    #[test]
    fn collections_need_the_marker_text() {
        let links = parse_collections(
            DEFAULT_LISTING_URL,
            "See also <a href=\"/government/collections/x\">X</a>",
        )
        .unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn missing_timestamp_rejects_row() {
        let mut row = sample_row();
        row["result"]["public_timestamp"] = json!(null);
        assert!(matches!(
            parse_whitehall_item(DEFAULT_LISTING_URL, &row),
            Err(AdapterError::MissingField("public_timestamp"))
        ));
    }

    #[test]
    fn next_page_link_is_resolved_against_current_page() {
        let source = WhitehallSource::default();
        let page = FetchedPage {
            url: DEFAULT_LISTING_URL.to_string(),
            cursor: source.first_cursor(),
            body: json!({
                "results": [sample_row()],
                "next_page_url": "/government/statistics.json?page=2"
            }),
        };
        let parsed = source.parse_page(&page).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(
            parsed.next,
            Some(PageCursor::Link(
                "https://www.gov.uk/government/statistics.json?page=2".to_string()
            ))
        );

        let last = FetchedPage {
            body: json!({"results": []}),
            ..page
        };
        assert_eq!(source.parse_page(&last).unwrap().next, None);
    }
}
