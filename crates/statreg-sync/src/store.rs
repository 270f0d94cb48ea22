//! SQLite schema and row access for one pipeline's table set.
//!
//! Every pipeline writes to its own tables, named `{prefix}_{table}`. Row access takes a
//! `&mut SqliteConnection` so callers decide the transaction boundary.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use statreg_core::{CollectionRef, ContactKey};
use tracing::{debug, info};

/// Opens the store. One connection: the harvester never has two statements in flight.
pub async fn connect_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Keyword,
    Contact,
    Organisation,
    Collection,
    Dataset,
    Distribution,
}

impl Table {
    fn suffix(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Contact => "contact",
            Self::Organisation => "organisation",
            Self::Collection => "collection",
            Self::Dataset => "dataset",
            Self::Distribution => "distribution",
        }
    }
}

/// Many-to-many join tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    DatasetKeyword,
    DatasetOrganisation,
    DatasetCollection,
    DatasetContact,
    DistributionContact,
}

impl Link {
    pub const ALL: [Link; 5] = [
        Link::DatasetKeyword,
        Link::DatasetOrganisation,
        Link::DatasetCollection,
        Link::DatasetContact,
        Link::DistributionContact,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Self::DatasetKeyword => "dataset_keyword",
            Self::DatasetOrganisation => "dataset_organisation",
            Self::DatasetCollection => "dataset_collection",
            Self::DatasetContact => "dataset_contact",
            Self::DistributionContact => "distribution_contact",
        }
    }

    fn owner(self) -> (Table, &'static str) {
        match self {
            Self::DistributionContact => (Table::Distribution, "distribution_id"),
            _ => (Table::Dataset, "dataset_id"),
        }
    }

    fn target(self) -> (Table, &'static str) {
        match self {
            Self::DatasetKeyword => (Table::Keyword, "keyword_id"),
            Self::DatasetOrganisation => (Table::Organisation, "organisation_id"),
            Self::DatasetCollection => (Table::Collection, "collection_id"),
            Self::DatasetContact | Self::DistributionContact => (Table::Contact, "contact_id"),
        }
    }
}

/// Tracked dataset attributes, without identity.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct DatasetRecord {
    pub source_id: Option<i64>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub national_statistic: Option<bool>,
    pub stats_type: Option<String>,
    pub government_name: Option<String>,
    /// Inline release shape only.
    pub published_at: Option<NaiveDateTime>,
    /// Inline release shape only.
    pub next_release: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DatasetRow {
    pub id: i64,
    pub uri: String,
    #[sqlx(flatten)]
    pub record: DatasetRecord,
}

#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct DistributionRecord {
    pub national_statistic: Option<bool>,
    pub version: Option<String>,
    pub edition: Option<String>,
    pub next_release: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DistributionRow {
    pub id: i64,
    pub dataset_id: i64,
    pub uri: String,
    pub release_date: NaiveDateTime,
    #[sqlx(flatten)]
    pub record: DistributionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OrganisationRow {
    pub id: i64,
    pub uri: String,
    pub label: Option<String>,
}

/// Table names for one schema target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSet {
    prefix: String,
}

impl TableSet {
    pub fn new(prefix: &str) -> Result<Self> {
        let valid = prefix.starts_with(|c: char| c.is_ascii_lowercase())
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            bail!("invalid table prefix {prefix:?}; expected [a-z][a-z0-9_]*");
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn table(&self, table: Table) -> String {
        format!("{}_{}", self.prefix, table.suffix())
    }

    pub fn link_table(&self, link: Link) -> String {
        format!("{}_{}", self.prefix, link.suffix())
    }

    pub fn ddl(&self) -> Vec<String> {
        let keyword = self.table(Table::Keyword);
        let contact = self.table(Table::Contact);
        let organisation = self.table(Table::Organisation);
        let collection = self.table(Table::Collection);
        let dataset = self.table(Table::Dataset);
        let distribution = self.table(Table::Distribution);

        let mut out = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {keyword} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE
                )"
            ),
            // NULLs never collide under UNIQUE, so the triple is deduplicated by lookup.
            format!(
                "CREATE TABLE IF NOT EXISTS {contact} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT,
                    name TEXT,
                    telephone TEXT
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {contact}_triple
                    ON {contact} (email, name, telephone)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {organisation} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uri TEXT NOT NULL UNIQUE,
                    label TEXT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {collection} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uri TEXT NOT NULL UNIQUE,
                    label TEXT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {dataset} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uri TEXT NOT NULL UNIQUE,
                    source_id INTEGER,
                    title TEXT,
                    summary TEXT,
                    national_statistic BOOLEAN,
                    stats_type TEXT,
                    government_name TEXT,
                    published_at TEXT,
                    next_release TEXT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {distribution} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    dataset_id INTEGER NOT NULL REFERENCES {dataset}(id),
                    uri TEXT NOT NULL,
                    release_date TEXT NOT NULL,
                    national_statistic BOOLEAN,
                    version TEXT,
                    edition TEXT,
                    next_release TEXT,
                    UNIQUE (dataset_id, uri, release_date)
                )"
            ),
        ];
        for link in Link::ALL {
            let (owner_table, owner_col) = link.owner();
            let (target_table, target_col) = link.target();
            out.push(format!(
                "CREATE TABLE IF NOT EXISTS {link_table} (
                    {owner_col} INTEGER NOT NULL REFERENCES {owner}(id),
                    {target_col} INTEGER NOT NULL REFERENCES {target}(id),
                    PRIMARY KEY ({owner_col}, {target_col})
                )",
                link_table = self.link_table(link),
                owner = self.table(owner_table),
                target = self.table(target_table),
            ));
        }
        out
    }

    pub async fn find_keyword(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<i64>> {
        let sql = format!("SELECT id FROM {} WHERE name = ?", self.table(Table::Keyword));
        sqlx::query_scalar(&sql)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("looking up keyword {name:?}"))
    }

    pub async fn insert_keyword(&self, conn: &mut SqliteConnection, name: &str) -> Result<i64> {
        let sql = format!("INSERT INTO {} (name) VALUES (?)", self.table(Table::Keyword));
        let done = sqlx::query(&sql)
            .bind(name)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting keyword {name:?}"))?;
        Ok(done.last_insert_rowid())
    }

    /// First contact whose triple matches exactly, with NULL matching NULL.
    pub async fn find_contact(
        &self,
        conn: &mut SqliteConnection,
        key: &ContactKey,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT id FROM {}
              WHERE email IS ? AND name IS ? AND telephone IS ?
              ORDER BY id LIMIT 1",
            self.table(Table::Contact)
        );
        sqlx::query_scalar(&sql)
            .bind(&key.email)
            .bind(&key.name)
            .bind(&key.telephone)
            .fetch_optional(&mut *conn)
            .await
            .context("looking up contact")
    }

    pub async fn insert_contact(
        &self,
        conn: &mut SqliteConnection,
        key: &ContactKey,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (email, name, telephone) VALUES (?, ?, ?)",
            self.table(Table::Contact)
        );
        let done = sqlx::query(&sql)
            .bind(&key.email)
            .bind(&key.name)
            .bind(&key.telephone)
            .execute(&mut *conn)
            .await
            .context("inserting contact")?;
        Ok(done.last_insert_rowid())
    }

    pub async fn find_organisation(
        &self,
        conn: &mut SqliteConnection,
        uri: &str,
    ) -> Result<Option<OrganisationRow>> {
        let sql = format!(
            "SELECT id, uri, label FROM {} WHERE uri = ?",
            self.table(Table::Organisation)
        );
        sqlx::query_as::<_, OrganisationRow>(&sql)
            .bind(uri)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("looking up organisation {uri}"))
    }

    /// Inserts the organisation or overwrites its label; returns its id.
    pub async fn upsert_organisation(
        &self,
        conn: &mut SqliteConnection,
        uri: &str,
        label: &str,
    ) -> Result<i64> {
        let table = self.table(Table::Organisation);
        match self.find_organisation(conn, uri).await? {
            Some(row) if row.label.as_deref() == Some(label) => Ok(row.id),
            Some(row) => {
                info!(
                    uri,
                    field = "label",
                    stored = row.label.as_deref().unwrap_or("None"),
                    fetched = label,
                    "{uri} label changed {} => {label}",
                    row.label.as_deref().unwrap_or("None")
                );
                let sql = format!("UPDATE {table} SET label = ? WHERE id = ?");
                sqlx::query(&sql)
                    .bind(label)
                    .bind(row.id)
                    .execute(&mut *conn)
                    .await
                    .with_context(|| format!("updating organisation {uri}"))?;
                Ok(row.id)
            }
            None => {
                let sql = format!("INSERT INTO {table} (uri, label) VALUES (?, ?)");
                let done = sqlx::query(&sql)
                    .bind(uri)
                    .bind(label)
                    .execute(&mut *conn)
                    .await
                    .with_context(|| format!("inserting organisation {uri}"))?;
                debug!(uri, label, "created organisation");
                Ok(done.last_insert_rowid())
            }
        }
    }

    /// Finds the collection by URI, creating it or filling a missing label.
    pub async fn ensure_collection(
        &self,
        conn: &mut SqliteConnection,
        collection: &CollectionRef,
    ) -> Result<i64> {
        let table = self.table(Table::Collection);
        let sql = format!("SELECT id, label FROM {table} WHERE uri = ?");
        let existing: Option<(i64, Option<String>)> = sqlx::query_as(&sql)
            .bind(&collection.uri)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("looking up collection {}", collection.uri))?;
        match existing {
            Some((id, None)) if collection.label.is_some() => {
                let sql = format!("UPDATE {table} SET label = ? WHERE id = ?");
                sqlx::query(&sql)
                    .bind(&collection.label)
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .with_context(|| format!("labelling collection {}", collection.uri))?;
                Ok(id)
            }
            Some((id, _)) => Ok(id),
            None => {
                let sql = format!("INSERT INTO {table} (uri, label) VALUES (?, ?)");
                let done = sqlx::query(&sql)
                    .bind(&collection.uri)
                    .bind(&collection.label)
                    .execute(&mut *conn)
                    .await
                    .with_context(|| format!("inserting collection {}", collection.uri))?;
                Ok(done.last_insert_rowid())
            }
        }
    }

    pub async fn find_dataset(
        &self,
        conn: &mut SqliteConnection,
        uri: &str,
    ) -> Result<Option<DatasetRow>> {
        let sql = format!(
            "SELECT id, uri, source_id, title, summary, national_statistic, stats_type,
                    government_name, published_at, next_release
               FROM {} WHERE uri = ?",
            self.table(Table::Dataset)
        );
        sqlx::query_as::<_, DatasetRow>(&sql)
            .bind(uri)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("looking up dataset {uri}"))
    }

    pub async fn insert_dataset(
        &self,
        conn: &mut SqliteConnection,
        uri: &str,
        record: &DatasetRecord,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (uri, source_id, title, summary, national_statistic, stats_type,
                             government_name, published_at, next_release)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table(Table::Dataset)
        );
        let done = sqlx::query(&sql)
            .bind(uri)
            .bind(record.source_id)
            .bind(&record.title)
            .bind(&record.summary)
            .bind(record.national_statistic)
            .bind(&record.stats_type)
            .bind(&record.government_name)
            .bind(record.published_at)
            .bind(record.next_release)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting dataset {uri}"))?;
        Ok(done.last_insert_rowid())
    }

    pub async fn update_dataset(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        record: &DatasetRecord,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET source_id = ?, title = ?, summary = ?, national_statistic = ?,
                    stats_type = ?, government_name = ?, published_at = ?, next_release = ?
              WHERE id = ?",
            self.table(Table::Dataset)
        );
        sqlx::query(&sql)
            .bind(record.source_id)
            .bind(&record.title)
            .bind(&record.summary)
            .bind(record.national_statistic)
            .bind(&record.stats_type)
            .bind(&record.government_name)
            .bind(record.published_at)
            .bind(record.next_release)
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("updating dataset {id}"))?;
        Ok(())
    }

    /// The dataset's distribution with this `(uri, release_date)` identity, if any.
    pub async fn find_distribution(
        &self,
        conn: &mut SqliteConnection,
        dataset_id: i64,
        uri: &str,
        release_date: NaiveDateTime,
    ) -> Result<Option<DistributionRow>> {
        let sql = format!(
            "SELECT id, dataset_id, uri, release_date, national_statistic, version, edition,
                    next_release
               FROM {} WHERE dataset_id = ? AND uri = ? AND release_date = ?",
            self.table(Table::Distribution)
        );
        sqlx::query_as::<_, DistributionRow>(&sql)
            .bind(dataset_id)
            .bind(uri)
            .bind(release_date)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("looking up distribution {uri} @ {release_date}"))
    }

    pub async fn insert_distribution(
        &self,
        conn: &mut SqliteConnection,
        dataset_id: i64,
        uri: &str,
        release_date: NaiveDateTime,
        record: &DistributionRecord,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (dataset_id, uri, release_date, national_statistic, version,
                             edition, next_release)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.table(Table::Distribution)
        );
        let done = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(uri)
            .bind(release_date)
            .bind(record.national_statistic)
            .bind(&record.version)
            .bind(&record.edition)
            .bind(record.next_release)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting distribution {uri}"))?;
        Ok(done.last_insert_rowid())
    }

    pub async fn update_distribution(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        record: &DistributionRecord,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET national_statistic = ?, version = ?, edition = ?, next_release = ?
              WHERE id = ?",
            self.table(Table::Distribution)
        );
        sqlx::query(&sql)
            .bind(record.national_statistic)
            .bind(&record.version)
            .bind(&record.edition)
            .bind(record.next_release)
            .bind(id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("updating distribution {id}"))?;
        Ok(())
    }

    pub async fn linked_ids(
        &self,
        conn: &mut SqliteConnection,
        link: Link,
        owner_id: i64,
    ) -> Result<BTreeSet<i64>> {
        let (_, owner_col) = link.owner();
        let (_, target_col) = link.target();
        let sql = format!(
            "SELECT {target_col} FROM {} WHERE {owner_col} = ?",
            self.link_table(link)
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(owner_id)
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("reading {}", self.link_table(link)))?;
        Ok(ids.into_iter().collect())
    }

    pub async fn add_link(
        &self,
        conn: &mut SqliteConnection,
        link: Link,
        owner_id: i64,
        target_id: i64,
    ) -> Result<()> {
        let (_, owner_col) = link.owner();
        let (_, target_col) = link.target();
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({owner_col}, {target_col}) VALUES (?, ?)",
            self.link_table(link)
        );
        sqlx::query(&sql)
            .bind(owner_id)
            .bind(target_id)
            .execute(&mut *conn)
            .await
            .with_context(|| {
                format!("linking {owner_id} -> {target_id} in {}", self.link_table(link))
            })?;
        Ok(())
    }

    pub async fn remove_link(
        &self,
        conn: &mut SqliteConnection,
        link: Link,
        owner_id: i64,
        target_id: i64,
    ) -> Result<()> {
        let (_, owner_col) = link.owner();
        let (_, target_col) = link.target();
        let sql = format!(
            "DELETE FROM {} WHERE {owner_col} = ? AND {target_col} = ?",
            self.link_table(link)
        );
        sqlx::query(&sql)
            .bind(owner_id)
            .bind(target_id)
            .execute(&mut *conn)
            .await
            .with_context(|| {
                format!("unlinking {owner_id} -> {target_id} in {}", self.link_table(link))
            })?;
        Ok(())
    }

    pub async fn count_rows(&self, conn: &mut SqliteConnection, table: Table) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table(table));
        sqlx::query_scalar(&sql)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("counting {}", self.table(table)))
    }
}

/// A pool plus the table set of one schema target.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    tables: TableSet,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool, prefix: &str) -> Result<Self> {
        Ok(Self {
            pool,
            tables: TableSet::new(prefix)?,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    /// Creates every table of this schema target if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting schema transaction")?;
        for statement in self.tables.ddl() {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("creating schema for prefix {}", self.tables.prefix()))?;
        }
        tx.commit().await.context("committing schema")?;
        debug!(prefix = self.tables.prefix(), "schema ready");
        Ok(())
    }
}
