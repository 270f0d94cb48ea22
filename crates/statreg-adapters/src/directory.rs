//! Known-organisation directory and heuristic matching of publisher display text.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use statreg_storage::HttpFetcher;
use tracing::info;

use crate::{json_str, AdapterContext, AdapterError};

pub const GSS_SPARQL_ENDPOINT: &str = "https://staging.gss-data.org.uk/sparql";

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

const ORGANISATIONS_QUERY: &str = r#"
PREFIX org: <http://www.w3.org/ns/org#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
SELECT DISTINCT ?org ?label
WHERE {
  ?org a org:Organization ;
    rdfs:label ?label .
}"#;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrganisationEntry {
    pub label: String,
    pub uri: String,
}

/// Label -> URI directory, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct OrganisationDirectory {
    by_label: BTreeMap<String, String>,
}

impl OrganisationDirectory {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = OrganisationEntry>,
    {
        let by_label = entries
            .into_iter()
            .filter(|e| !e.label.trim().is_empty())
            .map(|e| (e.label, e.uri))
            .collect();
        Self { by_label }
    }

    /// Reads `?org`/`?label` bindings from a SPARQL JSON result set.
    pub fn from_sparql_results(value: &JsonValue) -> Self {
        let bindings = value
            .get("results")
            .and_then(|r| r.get("bindings"))
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Self::new(bindings.iter().filter_map(|b| {
            Some(OrganisationEntry {
                label: json_str(b, &["label", "value"])?.to_string(),
                uri: json_str(b, &["org", "value"])?.to_string(),
            })
        }))
    }

    pub async fn fetch(
        http: &HttpFetcher,
        ctx: &AdapterContext,
        endpoint: &str,
    ) -> Result<Self, AdapterError> {
        let body = http
            .post_form_json(
                ctx.run_id,
                endpoint,
                SPARQL_RESULTS_JSON,
                &[("query", ORGANISATIONS_QUERY)],
            )
            .await?;
        let directory = Self::from_sparql_results(&body);
        info!(endpoint, organisations = directory.len(), "loaded organisation directory");
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = OrganisationEntry> + '_ {
        self.by_label.iter().map(|(label, uri)| OrganisationEntry {
            label: label.clone(),
            uri: uri.clone(),
        })
    }

    /// Every known organisation whose label shows up in `text`, per [`label_appears_in`].
    ///
    /// Best effort: short labels that are suffixes of longer names will over-match.
    pub fn match_display_text(&self, text: &str) -> Vec<OrganisationEntry> {
        self.entries()
            .filter(|entry| label_appears_in(&entry.label, text))
            .collect()
    }
}

/// Whether a publisher list mentions `label`.
///
/// The list may join names with "and" or commas, or carry `<abbr title="...">` markup,
/// so a label counts when it ends the text, is a `title` attribute, or precedes a conjunction.
pub fn label_appears_in(label: &str, text: &str) -> bool {
    if label.is_empty() {
        return false;
    }
    text.ends_with(label)
        || text.contains(&format!("title=\"{label}\""))
        || text.contains(&format!("{label} and "))
        || text.contains(&format!("{label}, "))
}
