//! Core domain model for the statistics registry harvester.

pub mod dates;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use dates::{normalize_timestamp, parse_fuzzy_date, DateError};

pub const CRATE_NAME: &str = "statreg-core";

/// How stored fields react when a fetch disagrees with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Only fill fields that are currently unset; associations are only ever added.
    FillOnly,
    /// Mirror the source: overwrite tracked fields and reconcile associations both ways.
    Sync,
}

/// Where release metadata is stored for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseShape {
    /// Each release is a separate distribution row owned by the dataset.
    Distributions,
    /// Release fields live directly on the dataset row.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsType {
    #[serde(rename = "Official Statistics")]
    OfficialStatistics,
    #[serde(rename = "National Statistics")]
    NationalStatistics,
    #[serde(rename = "Statistical data set")]
    StatisticalDataSet,
}

impl StatsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfficialStatistics => "Official Statistics",
            Self::NationalStatistics => "National Statistics",
            Self::StatisticalDataSet => "Statistical data set",
        }
    }

    /// Maps a publisher display label onto a known category; unknown labels are absent.
    pub fn from_display(label: &str) -> Option<Self> {
        match label.trim() {
            "Official Statistics" => Some(Self::OfficialStatistics),
            "National Statistics" => Some(Self::NationalStatistics),
            "Statistical data set" => Some(Self::StatisticalDataSet),
            _ => None,
        }
    }
}

/// Trims a value and treats the empty string as absent.
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Splits keyword entries that are themselves comma-joined strings.
///
/// Order of first appearance is kept and duplicates are dropped case-sensitively.
pub fn explode_keywords<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for entry in entries {
        for part in entry.as_ref().split(',') {
            if let Some(keyword) = normalize_optional(Some(part)) {
                if !out.contains(&keyword) {
                    out.push(keyword);
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub email: Option<String>,
    pub name: Option<String>,
    pub telephone: Option<String>,
}

impl ContactDraft {
    pub fn new(email: Option<&str>, name: Option<&str>, telephone: Option<&str>) -> Self {
        Self {
            email: normalize_optional(email),
            name: normalize_optional(name),
            telephone: normalize_optional(telephone),
        }
    }

    pub fn key(&self) -> ContactKey {
        ContactKey::new(
            self.email.as_deref(),
            self.name.as_deref(),
            self.telephone.as_deref(),
        )
    }
}

/// Identity of a contact: the `(email, name, telephone)` triple with empty strings folded
/// to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactKey {
    pub email: Option<String>,
    pub name: Option<String>,
    pub telephone: Option<String>,
}

impl ContactKey {
    pub fn new(email: Option<&str>, name: Option<&str>, telephone: Option<&str>) -> Self {
        Self {
            email: normalize_optional(email),
            name: normalize_optional(name),
            telephone: normalize_optional(telephone),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub uri: String,
    pub label: Option<String>,
}

/// Release metadata for one fetched item.
///
/// With [`ReleaseShape::Distributions`] this becomes a distribution keyed by
/// `(uri, release_date)`; with [`ReleaseShape::Inline`] it is folded into the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub uri: String,
    pub release_date: NaiveDateTime,
    pub next_release: Option<NaiveDate>,
    pub national_statistic: bool,
    pub version: Option<String>,
    pub edition: Option<String>,
}

/// Normalized handoff contract from source adapters into the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub dataset_uri: String,
    pub source_id: Option<i64>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub stats_type: Option<StatsType>,
    pub government_name: Option<String>,
    pub release: ReleaseInfo,
    pub keywords: Vec<String>,
    pub contact: Option<ContactDraft>,
    /// Free-text publisher list, matched against the organisation directory.
    pub organisations_text: Option<String>,
    pub collections: Vec<CollectionRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_explosion_splits_comma_joined_entries() {
        let keywords = explode_keywords(["Health, Education", "Crime"]);
        assert_eq!(keywords, vec!["Health", "Education", "Crime"]);
    }

    #[test]
    fn keyword_explosion_dedups_case_sensitively() {
        let keywords = explode_keywords(["Crime, crime", " Crime ,", ""]);
        assert_eq!(keywords, vec!["Crime", "crime"]);
    }

    #[test]
    fn optional_strings_fold_blank_to_none() {
        assert_eq!(normalize_optional(Some("  ")), None);
        assert_eq!(normalize_optional(None), None);
        assert_eq!(normalize_optional(Some(" Census ")), Some("Census".to_string()));
    }

    #[test]
    fn contact_key_treats_empty_and_absent_alike() {
        let a = ContactKey::new(Some("stats@ons.gov.uk"), Some(""), None);
        let b = ContactDraft::new(Some(" stats@ons.gov.uk "), None, Some("   ")).key();
        assert_eq!(a, b);
        assert_eq!(a.name, None);
        assert_eq!(a.telephone, None);
    }

    #[test]
    fn stats_type_round_trips_display_labels() {
        for st in [
            StatsType::OfficialStatistics,
            StatsType::NationalStatistics,
            StatsType::StatisticalDataSet,
        ] {
            assert_eq!(StatsType::from_display(st.as_str()), Some(st));
        }
        assert_eq!(StatsType::from_display("Research and analysis"), None);
    }
}
