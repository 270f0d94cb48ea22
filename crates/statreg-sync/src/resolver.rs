//! Entity resolution and upsert of normalized catalog items.
//!
//! One [`Resolver`] serves every pipeline: the update policy decides how disagreements with
//! stored rows are handled and the release shape decides where release metadata lives.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqliteConnection;
use statreg_adapters::OrganisationDirectory;
use statreg_core::{CatalogItem, ContactDraft, ContactKey, ReleaseInfo, ReleaseShape, UpdatePolicy};
use tracing::{debug, info};

use crate::store::{DatasetRecord, DatasetRow, DistributionRecord, Link, TableSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    Created,
    Updated,
    Unchanged,
}

impl ResolveOutcome {
    /// Whether the item left a durable change in the store.
    pub fn is_fresh(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Ids of the entities an item should be associated with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Associations {
    keywords: BTreeSet<i64>,
    organisations: BTreeSet<i64>,
    collections: BTreeSet<i64>,
    contacts: BTreeSet<i64>,
}

pub struct Resolver {
    tables: TableSet,
    policy: UpdatePolicy,
    shape: ReleaseShape,
    directory: OrganisationDirectory,
    keyword_ids: HashMap<String, i64>,
    contact_ids: HashMap<ContactKey, i64>,
    organisation_ids: HashMap<String, i64>,
}

impl Resolver {
    pub fn new(tables: TableSet, policy: UpdatePolicy, shape: ReleaseShape) -> Self {
        Self {
            tables,
            policy,
            shape,
            directory: OrganisationDirectory::default(),
            keyword_ids: HashMap::new(),
            contact_ids: HashMap::new(),
            organisation_ids: HashMap::new(),
        }
    }

    /// Upserts every directory entry and keeps the directory for matching publisher text.
    ///
    /// When several labels share one URI the first label (in label order) wins.
    pub async fn load_organisations(
        &mut self,
        conn: &mut SqliteConnection,
        directory: OrganisationDirectory,
    ) -> Result<usize> {
        let mut seen = HashSet::new();
        for entry in directory.entries() {
            if !seen.insert(entry.uri.clone()) {
                continue;
            }
            let id = self
                .tables
                .upsert_organisation(conn, &entry.uri, &entry.label)
                .await?;
            self.organisation_ids.insert(entry.uri, id);
        }
        self.directory = directory;
        Ok(seen.len())
    }

    /// Makes the store reflect `item` and reports whether anything changed.
    pub async fn resolve(
        &mut self,
        conn: &mut SqliteConnection,
        item: &CatalogItem,
    ) -> Result<ResolveOutcome> {
        let wanted = self.resolve_associations(conn, item).await?;
        let fetched = dataset_record(item, self.shape);
        match self.tables.find_dataset(conn, &item.dataset_uri).await? {
            None => self.create(conn, item, &fetched, &wanted).await,
            Some(stored) => self.update(conn, item, stored, &fetched, &wanted).await,
        }
    }

    async fn resolve_associations(
        &mut self,
        conn: &mut SqliteConnection,
        item: &CatalogItem,
    ) -> Result<Associations> {
        let mut out = Associations::default();
        for keyword in &item.keywords {
            out.keywords.insert(self.keyword_id(conn, keyword).await?);
        }
        if let Some(contact) = &item.contact {
            if let Some(id) = self.contact_id(conn, contact).await? {
                out.contacts.insert(id);
            }
        }
        if let Some(text) = &item.organisations_text {
            for entry in self.directory.match_display_text(text) {
                let id = match self.organisation_ids.get(&entry.uri) {
                    Some(id) => *id,
                    None => {
                        let id = self
                            .tables
                            .upsert_organisation(conn, &entry.uri, &entry.label)
                            .await?;
                        self.organisation_ids.insert(entry.uri.clone(), id);
                        id
                    }
                };
                out.organisations.insert(id);
            }
        }
        for collection in &item.collections {
            out.collections
                .insert(self.tables.ensure_collection(conn, collection).await?);
        }
        Ok(out)
    }

    async fn keyword_id(&mut self, conn: &mut SqliteConnection, name: &str) -> Result<i64> {
        if let Some(id) = self.keyword_ids.get(name) {
            return Ok(*id);
        }
        let id = match self.tables.find_keyword(conn, name).await? {
            Some(id) => id,
            None => self.tables.insert_keyword(conn, name).await?,
        };
        self.keyword_ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// `None` for a contact with no populated field.
    async fn contact_id(
        &mut self,
        conn: &mut SqliteConnection,
        contact: &ContactDraft,
    ) -> Result<Option<i64>> {
        let key = contact.key();
        if key.email.is_none() && key.name.is_none() && key.telephone.is_none() {
            return Ok(None);
        }
        if let Some(id) = self.contact_ids.get(&key) {
            return Ok(Some(*id));
        }
        let id = match self.tables.find_contact(conn, &key).await? {
            Some(id) => id,
            None => self.tables.insert_contact(conn, &key).await?,
        };
        self.contact_ids.insert(key, id);
        Ok(Some(id))
    }

    /// Dataset-level join tables and the ids each should hold.
    fn dataset_links<'a>(&self, wanted: &'a Associations) -> Vec<(Link, &'a BTreeSet<i64>)> {
        let mut links = vec![
            (Link::DatasetKeyword, &wanted.keywords),
            (Link::DatasetOrganisation, &wanted.organisations),
            (Link::DatasetCollection, &wanted.collections),
        ];
        if self.shape == ReleaseShape::Inline {
            links.push((Link::DatasetContact, &wanted.contacts));
        }
        links
    }

    async fn create(
        &mut self,
        conn: &mut SqliteConnection,
        item: &CatalogItem,
        fetched: &DatasetRecord,
        wanted: &Associations,
    ) -> Result<ResolveOutcome> {
        let dataset_id = self
            .tables
            .insert_dataset(conn, &item.dataset_uri, fetched)
            .await?;
        for (link, ids) in self.dataset_links(wanted) {
            for id in ids {
                self.tables.add_link(conn, link, dataset_id, *id).await?;
            }
        }
        if self.shape == ReleaseShape::Distributions {
            let release = &item.release;
            let distribution_id = self
                .tables
                .insert_distribution(
                    conn,
                    dataset_id,
                    &release.uri,
                    release.release_date,
                    &distribution_record(release),
                )
                .await?;
            for id in &wanted.contacts {
                self.tables
                    .add_link(conn, Link::DistributionContact, distribution_id, *id)
                    .await?;
            }
        }
        info!(uri = %item.dataset_uri, "created dataset");
        Ok(ResolveOutcome::Created)
    }

    async fn update(
        &mut self,
        conn: &mut SqliteConnection,
        item: &CatalogItem,
        stored: DatasetRow,
        fetched: &DatasetRecord,
        wanted: &Associations,
    ) -> Result<ResolveOutcome> {
        let uri = item.dataset_uri.as_str();
        let mut fresh = false;
        let mut new_distribution = false;

        let mut owners: Vec<(Link, i64, &BTreeSet<i64>)> = self
            .dataset_links(wanted)
            .into_iter()
            .map(|(link, ids)| (link, stored.id, ids))
            .collect();

        if self.shape == ReleaseShape::Distributions {
            let release = &item.release;
            let incoming = distribution_record(release);
            let existing = self
                .tables
                .find_distribution(conn, stored.id, &release.uri, release.release_date)
                .await?;
            let distribution_id = match existing {
                Some(row) => {
                    let mut record = row.record.clone();
                    if merge_distribution(self.policy, &release.uri, &mut record, &incoming) {
                        self.tables.update_distribution(conn, row.id, &record).await?;
                        fresh = true;
                    }
                    row.id
                }
                None => {
                    let id = self
                        .tables
                        .insert_distribution(
                            conn,
                            stored.id,
                            &release.uri,
                            release.release_date,
                            &incoming,
                        )
                        .await?;
                    info!(
                        uri,
                        distribution = %release.uri,
                        release_date = %release.release_date,
                        "new distribution"
                    );
                    new_distribution = true;
                    fresh = true;
                    id
                }
            };
            owners.push((Link::DistributionContact, distribution_id, &wanted.contacts));
        }

        let mut current = Vec::with_capacity(owners.len());
        for (link, owner_id, ids) in owners {
            let have = self.tables.linked_ids(conn, link, owner_id).await?;
            current.push((link, owner_id, ids, have));
        }

        match self.policy {
            UpdatePolicy::FillOnly => {
                let mut record = stored.record.clone();
                if merge_dataset(self.policy, uri, &mut record, fetched) {
                    self.tables.update_dataset(conn, stored.id, &record).await?;
                    fresh = true;
                }
                for (link, owner_id, ids, have) in &current {
                    for id in ids.difference(have) {
                        self.tables.add_link(conn, *link, *owner_id, *id).await?;
                        fresh = true;
                    }
                }
            }
            UpdatePolicy::Sync => {
                let associations_differ = current.iter().any(|(_, _, ids, have)| *ids != have);
                let republished = self.shape == ReleaseShape::Inline
                    && stored.record.published_at != fetched.published_at;
                if associations_differ || republished || new_distribution {
                    let mut record = stored.record.clone();
                    if merge_dataset(self.policy, uri, &mut record, fetched) {
                        self.tables.update_dataset(conn, stored.id, &record).await?;
                    }
                    for (link, owner_id, ids, have) in &current {
                        for id in ids.difference(have) {
                            self.tables.add_link(conn, *link, *owner_id, *id).await?;
                        }
                        for id in have.difference(ids) {
                            self.tables.remove_link(conn, *link, *owner_id, *id).await?;
                        }
                    }
                    fresh = true;
                }
            }
        }

        if fresh {
            debug!(uri, "updated dataset");
            Ok(ResolveOutcome::Updated)
        } else {
            Ok(ResolveOutcome::Unchanged)
        }
    }
}

fn dataset_record(item: &CatalogItem, shape: ReleaseShape) -> DatasetRecord {
    let inline = shape == ReleaseShape::Inline;
    DatasetRecord {
        source_id: item.source_id,
        title: item.title.clone(),
        summary: item.summary.clone(),
        national_statistic: Some(item.release.national_statistic),
        stats_type: item.stats_type.map(|s| s.as_str().to_string()),
        government_name: item.government_name.clone(),
        published_at: inline.then_some(item.release.release_date),
        next_release: if inline { item.release.next_release } else { None },
    }
}

fn distribution_record(release: &ReleaseInfo) -> DistributionRecord {
    DistributionRecord {
        national_statistic: Some(release.national_statistic),
        version: release.version.clone(),
        edition: release.edition.clone(),
        next_release: release.next_release,
    }
}

fn merge_dataset(
    policy: UpdatePolicy,
    uri: &str,
    stored: &mut DatasetRecord,
    fetched: &DatasetRecord,
) -> bool {
    let mut changed = false;
    changed |= merge_field(
        policy,
        uri,
        "source_id",
        &mut stored.source_id,
        &fetched.source_id,
    );
    changed |= merge_field(policy, uri, "title", &mut stored.title, &fetched.title);
    changed |= merge_field(policy, uri, "summary", &mut stored.summary, &fetched.summary);
    changed |= merge_field(
        policy,
        uri,
        "national_statistic",
        &mut stored.national_statistic,
        &fetched.national_statistic,
    );
    changed |= merge_field(
        policy,
        uri,
        "stats_type",
        &mut stored.stats_type,
        &fetched.stats_type,
    );
    changed |= merge_field(
        policy,
        uri,
        "government_name",
        &mut stored.government_name,
        &fetched.government_name,
    );
    changed |= merge_field(
        policy,
        uri,
        "published_at",
        &mut stored.published_at,
        &fetched.published_at,
    );
    changed |= merge_field(
        policy,
        uri,
        "next_release",
        &mut stored.next_release,
        &fetched.next_release,
    );
    changed
}

fn merge_distribution(
    policy: UpdatePolicy,
    uri: &str,
    stored: &mut DistributionRecord,
    fetched: &DistributionRecord,
) -> bool {
    let mut changed = false;
    changed |= merge_field(
        policy,
        uri,
        "national_statistic",
        &mut stored.national_statistic,
        &fetched.national_statistic,
    );
    changed |= merge_field(policy, uri, "version", &mut stored.version, &fetched.version);
    changed |= merge_field(policy, uri, "edition", &mut stored.edition, &fetched.edition);
    changed |= merge_field(
        policy,
        uri,
        "next_release",
        &mut stored.next_release,
        &fetched.next_release,
    );
    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeAction {
    Same,
    Overwrite,
    KeepStored,
}

/// Fill-only never replaces a set value, even with an absent one.
fn merge_action<T: PartialEq>(
    policy: UpdatePolicy,
    stored: &Option<T>,
    fetched: &Option<T>,
) -> MergeAction {
    if stored == fetched {
        return MergeAction::Same;
    }
    match (policy, stored.is_some()) {
        (UpdatePolicy::Sync, _) | (UpdatePolicy::FillOnly, false) => MergeAction::Overwrite,
        (UpdatePolicy::FillOnly, true) => MergeAction::KeepStored,
    }
}

/// Applies one field under `policy`; returns whether `stored` changed.
///
/// A disagreement that fill-only refuses to apply is logged instead.
fn merge_field<T>(
    policy: UpdatePolicy,
    uri: &str,
    field: &'static str,
    stored: &mut Option<T>,
    fetched: &Option<T>,
) -> bool
where
    T: Clone + PartialEq + Display,
{
    let action = merge_action(policy, stored, fetched);
    if action == MergeAction::Same {
        return false;
    }
    let was = shown(stored);
    let now = shown(fetched);
    match action {
        MergeAction::Overwrite => {
            info!(
                uri,
                field,
                stored = %was,
                fetched = %now,
                "{uri} {field} changed {was} => {now}"
            );
            *stored = fetched.clone();
            true
        }
        MergeAction::KeepStored => {
            info!(
                uri,
                field,
                stored = %was,
                fetched = %now,
                "{uri} {field} changed {was} => {now}; keeping stored value"
            );
            false
        }
        MergeAction::Same => false,
    }
}

fn shown<T: Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "None".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{connect_pool, CatalogStore, Table};
    use chrono::{NaiveDate, NaiveDateTime};
    use sqlx::pool::PoolConnection;
    use sqlx::Sqlite;
    use statreg_adapters::OrganisationEntry;
    use statreg_core::CollectionRef;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, day)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn item(uri: &str, day: u32) -> CatalogItem {
        CatalogItem {
            dataset_uri: uri.to_string(),
            source_id: None,
            title: Some("Consumer price inflation".to_string()),
            summary: None,
            stats_type: None,
            government_name: None,
            release: ReleaseInfo {
                uri: format!("{uri}/current"),
                release_date: at(day),
                next_release: None,
                national_statistic: true,
                version: None,
                edition: Some("current".to_string()),
            },
            keywords: vec!["Health".to_string(), "Education".to_string()],
            contact: Some(ContactDraft::new(Some("cpi@ons.gov.uk"), Some("CPI team"), None)),
            organisations_text: None,
            collections: Vec::new(),
        }
    }

    async fn setup(
        policy: UpdatePolicy,
        shape: ReleaseShape,
    ) -> (CatalogStore, Resolver, PoolConnection<Sqlite>) {
        let pool = connect_pool("sqlite::memory:").await.unwrap();
        let store = CatalogStore::new(pool, "t").unwrap();
        store.ensure_schema().await.unwrap();
        let resolver = Resolver::new(store.tables().clone(), policy, shape);
        let conn = store.pool().acquire().await.unwrap();
        (store, resolver, conn)
    }

    fn two_organisations() -> OrganisationDirectory {
        OrganisationDirectory::new([
            OrganisationEntry {
                label: "Department for Education".to_string(),
                uri: "http://o/dfe".to_string(),
            },
            OrganisationEntry {
                label: "NHS England".to_string(),
                uri: "http://o/nhse".to_string(),
            },
        ])
    }

    async fn linked_names(
        store: &CatalogStore,
        conn: &mut SqliteConnection,
        uri: &str,
    ) -> BTreeSet<String> {
        let sql = format!(
            "SELECT k.name FROM {kw} k JOIN {link} l ON l.keyword_id = k.id
               JOIN {ds} d ON d.id = l.dataset_id WHERE d.uri = ?",
            kw = store.tables().table(Table::Keyword),
            link = store.tables().link_table(Link::DatasetKeyword),
            ds = store.tables().table(Table::Dataset),
        );
        let names: Vec<String> = sqlx::query_scalar(&sql)
            .bind(uri)
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        names.into_iter().collect()
    }

    #[tokio::test]
    async fn fill_only_never_overwrites_a_set_field() {
        let (store, mut resolver, mut conn) =
            setup(UpdatePolicy::FillOnly, ReleaseShape::Distributions).await;
        let first = item("https://d/cpi", 4);
        assert_eq!(resolver.resolve(&mut conn, &first).await.unwrap(), ResolveOutcome::Created);

        let mut second = first.clone();
        second.title = Some("Renamed upstream".to_string());
        second.summary = Some("Now with a summary".to_string());
        assert_eq!(resolver.resolve(&mut conn, &second).await.unwrap(), ResolveOutcome::Updated);

        let row = store
            .tables()
            .find_dataset(&mut conn, "https://d/cpi")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.title.as_deref(), Some("Consumer price inflation"));
        assert_eq!(row.record.summary.as_deref(), Some("Now with a summary"));

        // The disagreement on title is only logged.
        assert_eq!(resolver.resolve(&mut conn, &second).await.unwrap(), ResolveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn fill_only_adds_associations_but_never_removes() {
        let (store, mut resolver, mut conn) =
            setup(UpdatePolicy::FillOnly, ReleaseShape::Distributions).await;
        let first = item("https://d/cpi", 4);
        resolver.resolve(&mut conn, &first).await.unwrap();

        let mut second = first.clone();
        second.keywords = vec!["Crime".to_string()];
        assert_eq!(resolver.resolve(&mut conn, &second).await.unwrap(), ResolveOutcome::Updated);
        assert_eq!(
            linked_names(&store, &mut conn, "https://d/cpi").await,
            BTreeSet::from(["Crime".to_string(), "Education".to_string(), "Health".to_string()])
        );
    }

    #[tokio::test]
    async fn new_release_date_adds_a_distribution() {
        let (store, mut resolver, mut conn) =
            setup(UpdatePolicy::FillOnly, ReleaseShape::Distributions).await;
        resolver.resolve(&mut conn, &item("https://d/cpi", 4)).await.unwrap();
        assert_eq!(
            resolver.resolve(&mut conn, &item("https://d/cpi", 4)).await.unwrap(),
            ResolveOutcome::Unchanged
        );
        assert_eq!(
            resolver.resolve(&mut conn, &item("https://d/cpi", 18)).await.unwrap(),
            ResolveOutcome::Updated
        );
        let tables = store.tables();
        assert_eq!(tables.count_rows(&mut conn, Table::Dataset).await.unwrap(), 1);
        assert_eq!(tables.count_rows(&mut conn, Table::Distribution).await.unwrap(), 2);

        let dataset = tables.find_dataset(&mut conn, "https://d/cpi").await.unwrap().unwrap();
        let latest = tables
            .find_distribution(&mut conn, dataset.id, "https://d/cpi/current", at(18))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            tables
                .linked_ids(&mut conn, Link::DistributionContact, latest.id)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(tables
            .linked_ids(&mut conn, Link::DatasetContact, dataset.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sync_mirrors_the_fetched_association_set() {
        let (store, mut resolver, mut conn) = setup(UpdatePolicy::Sync, ReleaseShape::Inline).await;
        resolver
            .load_organisations(&mut conn, two_organisations())
            .await
            .unwrap();
        let mut first = item("https://gov/stats", 4);
        first.collections = vec![CollectionRef {
            uri: "https://gov/collections/a".to_string(),
            label: Some("A".to_string()),
        }];
        first.organisations_text = Some("NHS England and Department for Education".to_string());
        resolver.resolve(&mut conn, &first).await.unwrap();

        let tables = store.tables();
        let dataset = tables.find_dataset(&mut conn, "https://gov/stats").await.unwrap().unwrap();
        let dfe = tables.find_organisation(&mut conn, "http://o/dfe").await.unwrap().unwrap();
        let nhse = tables.find_organisation(&mut conn, "http://o/nhse").await.unwrap().unwrap();
        assert_eq!(
            tables
                .linked_ids(&mut conn, Link::DatasetOrganisation, dataset.id)
                .await
                .unwrap(),
            BTreeSet::from([dfe.id, nhse.id])
        );

        let mut second = first.clone();
        second.keywords = vec!["Crime".to_string(), "Health".to_string()];
        second.collections.clear();
        second.contact = None;
        second.organisations_text = Some("NHS England".to_string());
        assert_eq!(resolver.resolve(&mut conn, &second).await.unwrap(), ResolveOutcome::Updated);

        assert_eq!(
            linked_names(&store, &mut conn, "https://gov/stats").await,
            BTreeSet::from(["Crime".to_string(), "Health".to_string()])
        );
        for link in [Link::DatasetCollection, Link::DatasetContact] {
            assert!(tables.linked_ids(&mut conn, link, dataset.id).await.unwrap().is_empty());
        }
        assert_eq!(
            tables
                .linked_ids(&mut conn, Link::DatasetOrganisation, dataset.id)
                .await
                .unwrap(),
            BTreeSet::from([nhse.id])
        );
        assert_eq!(resolver.resolve(&mut conn, &second).await.unwrap(), ResolveOutcome::Unchanged);
    }

    #[tokio::test]
    async fn sync_overwrites_fields_only_when_republished() {
        let (store, mut resolver, mut conn) = setup(UpdatePolicy::Sync, ReleaseShape::Inline).await;
        let first = item("https://gov/stats", 4);
        resolver.resolve(&mut conn, &first).await.unwrap();

        let mut retitled = first.clone();
        retitled.title = Some("Retitled".to_string());
        assert_eq!(
            resolver.resolve(&mut conn, &retitled).await.unwrap(),
            ResolveOutcome::Unchanged
        );

        let mut republished = retitled.clone();
        republished.release.release_date = at(11);
        republished.summary = Some("Summary".to_string());
        assert_eq!(
            resolver.resolve(&mut conn, &republished).await.unwrap(),
            ResolveOutcome::Updated
        );
        let row = store
            .tables()
            .find_dataset(&mut conn, "https://gov/stats")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.title.as_deref(), Some("Retitled"));
        assert_eq!(row.record.summary.as_deref(), Some("Summary"));
        assert_eq!(row.record.published_at, Some(at(11)));
    }

    #[tokio::test]
    async fn shared_keywords_and_contacts_are_stored_once() {
        let (store, mut resolver, mut conn) =
            setup(UpdatePolicy::FillOnly, ReleaseShape::Distributions).await;
        resolver.resolve(&mut conn, &item("https://d/one", 4)).await.unwrap();
        resolver.resolve(&mut conn, &item("https://d/two", 4)).await.unwrap();

        // A fresh resolver has empty caches and must find the persisted rows.
        let mut cold = Resolver::new(
            store.tables().clone(),
            UpdatePolicy::FillOnly,
            ReleaseShape::Distributions,
        );
        cold.resolve(&mut conn, &item("https://d/three", 4)).await.unwrap();

        let tables = store.tables();
        assert_eq!(tables.count_rows(&mut conn, Table::Dataset).await.unwrap(), 3);
        assert_eq!(tables.count_rows(&mut conn, Table::Keyword).await.unwrap(), 2);
        assert_eq!(tables.count_rows(&mut conn, Table::Contact).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blank_contact_is_not_stored() {
        let (store, mut resolver, mut conn) = setup(UpdatePolicy::Sync, ReleaseShape::Inline).await;
        let mut blank = item("https://gov/stats", 4);
        blank.contact = Some(ContactDraft::new(Some(" "), None, Some("")));
        resolver.resolve(&mut conn, &blank).await.unwrap();
        assert_eq!(store.tables().count_rows(&mut conn, Table::Contact).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publisher_text_links_directory_organisations() {
        let (store, mut resolver, mut conn) = setup(UpdatePolicy::Sync, ReleaseShape::Inline).await;
        let directory = two_organisations();
        assert_eq!(resolver.load_organisations(&mut conn, directory).await.unwrap(), 2);

        let mut row = item("https://gov/stats", 4);
        row.organisations_text =
            Some("<abbr title=\"Department for Education\">DfE</abbr>".to_string());
        resolver.resolve(&mut conn, &row).await.unwrap();

        let tables = store.tables();
        let dataset = tables.find_dataset(&mut conn, "https://gov/stats").await.unwrap().unwrap();
        let dfe = tables.find_organisation(&mut conn, "http://o/dfe").await.unwrap().unwrap();
        assert_eq!(
            tables
                .linked_ids(&mut conn, Link::DatasetOrganisation, dataset.id)
                .await
                .unwrap(),
            BTreeSet::from([dfe.id])
        );
    }

    #[test]
    fn merge_field_policies() {
        let fill = UpdatePolicy::FillOnly;
        let mut stored = Some("a".to_string());
        assert!(!merge_field(fill, "u", "title", &mut stored, &Some("b".to_string())));
        assert_eq!(stored.as_deref(), Some("a"));
        assert!(!merge_field(fill, "u", "title", &mut stored, &None));
        assert_eq!(stored.as_deref(), Some("a"));
        assert!(merge_field(UpdatePolicy::Sync, "u", "title", &mut stored, &None));
        assert_eq!(stored, None);
        assert!(merge_field(fill, "u", "title", &mut stored, &Some("c".to_string())));
        assert_eq!(stored.as_deref(), Some("c"));
    }

    #[test]
    fn fill_only_reports_every_refused_disagreement() {
        let fill = UpdatePolicy::FillOnly;
        let set = Some(1);
        assert_eq!(merge_action(fill, &set, &Some(2)), MergeAction::KeepStored);
        // An upstream value that went missing is a disagreement too.
        assert_eq!(merge_action(fill, &set, &None), MergeAction::KeepStored);
        assert_eq!(merge_action(fill, &None, &set), MergeAction::Overwrite);
        assert_eq!(merge_action(fill, &set, &set), MergeAction::Same);
        assert_eq!(merge_action(UpdatePolicy::Sync, &set, &None), MergeAction::Overwrite);
    }
}
