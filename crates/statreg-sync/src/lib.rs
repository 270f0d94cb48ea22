//! Harvest orchestration: pipeline presets, configuration, runs and scheduling.

pub mod pagination;
pub mod resolver;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use statreg_adapters::directory::GSS_SPARQL_ENDPOINT;
use statreg_adapters::{
    ons, whitehall, AdapterContext, CatalogSource, OnsSource, OrganisationDirectory,
    WhitehallSource,
};
use statreg_core::{ReleaseShape, UpdatePolicy};
use statreg_storage::{HttpClientConfig, HttpFetcher};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub use pagination::{
    next_state, PageFeed, PageTally, PaginationController, PaginationState, SourceFeed,
};
pub use resolver::{ResolveOutcome, Resolver};
pub use store::{connect_pool, CatalogStore, TableSet};

pub const CRATE_NAME: &str = "statreg-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sparql_endpoint: String,
    pub ons_api_url: String,
    pub whitehall_listing_url: String,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://stats.db?mode=rwc".to_string()),
            cache_dir: std::env::var("HARVEST_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".cache")),
            user_agent: std::env::var("HARVEST_USER_AGENT")
                .unwrap_or_else(|_| "statreg-harvester/0.1".to_string()),
            http_timeout_secs: std::env::var("HARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            sparql_endpoint: std::env::var("HARVEST_SPARQL_ENDPOINT")
                .unwrap_or_else(|_| GSS_SPARQL_ENDPOINT.to_string()),
            ons_api_url: std::env::var("HARVEST_ONS_API_URL")
                .unwrap_or_else(|_| ons::DEFAULT_API_URL.to_string()),
            whitehall_listing_url: std::env::var("HARVEST_WHITEHALL_LISTING_URL")
                .unwrap_or_else(|_| whitehall::DEFAULT_LISTING_URL.to_string()),
            scheduler_enabled: std::env::var("HARVEST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            harvest_cron: std::env::var("HARVEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ons,
    Whitehall,
}

impl SourceKind {
    pub fn source_id(self) -> &'static str {
        match self {
            Self::Ons => ons::SOURCE_ID,
            Self::Whitehall => whitehall::SOURCE_ID,
        }
    }

    /// The adapter for this source, pointed at the configured listing endpoint.
    pub fn build(self, config: &HarvestConfig) -> Box<dyn CatalogSource> {
        match self {
            Self::Ons => Box::new(OnsSource {
                api_url: config.ons_api_url.clone(),
                ..OnsSource::default()
            }),
            Self::Whitehall => Box::new(WhitehallSource {
                listing_url: config.whitehall_listing_url.clone(),
            }),
        }
    }
}

/// A source bound to a schema target and an update behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    pub name: &'static str,
    pub source: SourceKind,
    pub table_prefix: &'static str,
    pub policy: UpdatePolicy,
    pub shape: ReleaseShape,
    /// Load and upsert the organisation directory before paging.
    pub organisation_directory: bool,
}

pub const PIPELINES: [PipelineSpec; 3] = [
    PipelineSpec {
        name: "ons",
        source: SourceKind::Ons,
        table_prefix: "ons",
        policy: UpdatePolicy::FillOnly,
        shape: ReleaseShape::Distributions,
        organisation_directory: false,
    },
    PipelineSpec {
        name: "whitehall",
        source: SourceKind::Whitehall,
        table_prefix: "wh",
        policy: UpdatePolicy::Sync,
        shape: ReleaseShape::Inline,
        organisation_directory: true,
    },
    PipelineSpec {
        name: "whitehall-staging",
        source: SourceKind::Whitehall,
        table_prefix: "stg_wh",
        policy: UpdatePolicy::Sync,
        shape: ReleaseShape::Inline,
        organisation_directory: true,
    },
];

pub fn pipeline_spec(name: &str) -> Option<PipelineSpec> {
    PIPELINES.iter().copied().find(|p| p.name == name)
}

/// The named presets in the given order; every preset when `names` is empty.
pub fn select_pipelines(names: &[String]) -> Result<Vec<PipelineSpec>> {
    if names.is_empty() {
        return Ok(PIPELINES.to_vec());
    }
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match pipeline_spec(name) {
            Some(spec) => out.push(spec),
            None => {
                let known: Vec<&str> = PIPELINES.iter().map(|p| p.name).collect();
                bail!("unknown pipeline {name:?}; known pipelines: {}", known.join(", "));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub organisations: usize,
    pub pages_fetched: usize,
    pub items_seen: usize,
    pub items_skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Store pool and HTTP client shared by every pipeline run of this process.
pub struct Harvester {
    config: HarvestConfig,
    pool: SqlitePool,
    http: HttpFetcher,
}

impl Harvester {
    pub async fn connect(config: HarvestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            cache_dir: Some(config.cache_dir.clone()),
            ..Default::default()
        })?;
        let pool = connect_pool(&config.database_url).await?;
        Ok(Self::from_parts(config, pool, http))
    }

    pub fn from_parts(config: HarvestConfig, pool: SqlitePool, http: HttpFetcher) -> Self {
        Self { config, pool, http }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub async fn ensure_schemas(&self, specs: &[PipelineSpec]) -> Result<()> {
        for spec in specs {
            CatalogStore::new(self.pool.clone(), spec.table_prefix)?
                .ensure_schema()
                .await
                .with_context(|| format!("creating schema for pipeline {}", spec.name))?;
        }
        Ok(())
    }

    pub async fn run_pipeline(&self, spec: &PipelineSpec) -> Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest", pipeline = spec.name, %run_id);
        self.run_pipeline_inner(spec, run_id).instrument(span).await
    }

    async fn run_pipeline_inner(
        &self,
        spec: &PipelineSpec,
        run_id: Uuid,
    ) -> Result<HarvestRunSummary> {
        let started_at = Utc::now();
        let store = CatalogStore::new(self.pool.clone(), spec.table_prefix)?;
        store.ensure_schema().await?;
        let source = spec.source.build(&self.config);
        let ctx = AdapterContext { run_id };
        let mut resolver = Resolver::new(store.tables().clone(), spec.policy, spec.shape);

        let mut organisations = 0usize;
        if spec.organisation_directory {
            let endpoint = &self.config.sparql_endpoint;
            let directory = OrganisationDirectory::fetch(&self.http, &ctx, endpoint)
                .await
                .context("loading organisation directory")?;
            let mut tx = store
                .pool()
                .begin()
                .await
                .context("starting organisation transaction")?;
            organisations = resolver.load_organisations(&mut *tx, directory).await?;
            tx.commit().await.context("committing organisations")?;
        }

        let mut feed = SourceFeed::new(source.as_ref(), &self.http, ctx);
        let tally = PaginationController::run(&mut feed, &store, &mut resolver).await?;
        let finished_at = Utc::now();
        info!(
            pages = tally.pages_fetched,
            created = tally.created,
            updated = tally.updated,
            unchanged = tally.unchanged,
            skipped = tally.items_skipped,
            "harvest finished"
        );

        Ok(HarvestRunSummary {
            run_id,
            pipeline: spec.name.to_string(),
            started_at,
            finished_at,
            organisations,
            pages_fetched: tally.pages_fetched,
            items_seen: tally.items_seen,
            items_skipped: tally.items_skipped,
            created: tally.created,
            updated: tally.updated,
            unchanged: tally.unchanged,
        })
    }

    /// Runs the pipelines one after another; the first failure aborts the rest.
    pub async fn run_all(&self, specs: &[PipelineSpec]) -> Result<Vec<HarvestRunSummary>> {
        let mut summaries = Vec::with_capacity(specs.len());
        for spec in specs {
            let summary = self
                .run_pipeline(spec)
                .await
                .with_context(|| format!("pipeline {} failed", spec.name))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.harvest_cron.clone();
        let harvester = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let harvester = Arc::clone(&harvester);
            Box::pin(async move {
                let specs = PIPELINES.to_vec();
                match harvester.run_all(&specs).await {
                    Ok(summaries) => info!(runs = summaries.len(), "scheduled harvest finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn run_pipelines_from_env(names: &[String]) -> Result<Vec<HarvestRunSummary>> {
    let specs = select_pipelines(names)?;
    let harvester = Harvester::connect(HarvestConfig::from_env()).await?;
    let result = harvester.run_all(&specs).await;
    harvester.close().await;
    result
}
