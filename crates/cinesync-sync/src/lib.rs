//! Sync orchestration: drives the dataset through the external sort-merge
//! pipeline and applies the resulting delta to the catalog.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cinesync_core::{RowSchema, Work};
use cinesync_pipeline::{
    diff_sorted, merge_rounds, sort_chunks, sort_dedupe, split_into_chunks, SortedWorks,
    DEFAULT_CHUNK_SIZE,
};
use cinesync_storage::{
    ArchiveFetcher, ArchiveFetcherConfig, CatalogStore, MemoryCatalog, TsvRowSource,
};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cinesync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dataset_url: String,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub chunk_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub row_schema: RowSchema,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            dataset_url: std::env::var("CINESYNC_DATASET_URL")
                .unwrap_or_else(|_| "https://datasets.imdbws.com/title.basics.tsv.gz".to_string()),
            archive_dir: std::env::var("CINESYNC_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archives")),
            reports_dir: std::env::var("CINESYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            chunk_size: std::env::var("CINESYNC_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            http_timeout_secs: std::env::var("CINESYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            user_agent: std::env::var("CINESYNC_USER_AGENT")
                .unwrap_or_else(|_| "cinesync/0.1".to_string()),
            scheduler_enabled: std::env::var("CINESYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CINESYNC_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            row_schema: RowSchema::default(),
        }
    }
}

/// Counts reported for one synchronization run. On a dry run `added` and
/// `removed` are the delta sizes that would have been applied.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped: usize,
    pub catalog_before: usize,
    pub added: usize,
    pub removed: usize,
    pub dry_run: bool,
    pub report_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: ArchiveFetcher,
    catalog: Arc<dyn CatalogStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, catalog: Arc<dyn CatalogStore>) -> Result<Self> {
        let fetcher = ArchiveFetcher::new(ArchiveFetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            fetcher,
            catalog,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Download the current dataset archive and synchronize the catalog
    /// against it.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let archive = self.download_archive().await?;
        self.sync_from_archive(&archive).await
    }

    /// Download the current dataset archive and report the delta without
    /// applying it.
    pub async fn plan_once(&self) -> Result<SyncRunSummary> {
        let archive = self.download_archive().await?;
        self.plan_from_archive(&archive).await
    }

    async fn download_archive(&self) -> Result<PathBuf> {
        self.fetcher
            .download(&self.config.dataset_url, &self.config.archive_dir)
            .await
            .context("retrieving dataset archive")
    }

    /// Synchronize the catalog against an already-downloaded archive.
    ///
    /// Additions are applied by bulk insert, removals by per-record delete.
    /// There is no rollback of a partially applied bulk insert: if the store
    /// fails midway, already-inserted records remain and the error
    /// propagates. That boundary belongs to the catalog collaborator, not
    /// this layer.
    pub async fn sync_from_archive(&self, archive: &Path) -> Result<SyncRunSummary> {
        self.execute(archive, true).await
    }

    /// Compute the delta for an already-downloaded archive and report it,
    /// leaving the catalog untouched.
    pub async fn plan_from_archive(&self, archive: &Path) -> Result<SyncRunSummary> {
        self.execute(archive, false).await
    }

    async fn execute(&self, archive: &Path, apply: bool) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, archive = %archive.display(), "starting sync run");

        let scraped = self.build_scraped_set(archive).await?;
        let scraped_count = scraped.len();

        let catalog_works = self
            .catalog
            .read_all()
            .await
            .context("reading catalog contents")?;
        let catalog_before = catalog_works.len();
        // one chunk-sized sort is enough for the catalog side; it is already
        // materialized in memory
        let catalog_set = sort_dedupe(catalog_works);

        let delta = diff_sorted(scraped, catalog_set);
        info!(
            %run_id,
            additions = delta.additions.len(),
            removals = delta.removals.len(),
            "computed sync delta"
        );

        let (added, removed) = if apply {
            let added = if delta.additions.is_empty() {
                0
            } else {
                self.catalog
                    .bulk_insert(delta.additions.as_slice())
                    .await
                    .context("applying catalog additions")?
            };

            let mut removed = 0usize;
            for work in delta.removals.iter() {
                self.catalog
                    .delete(work)
                    .await
                    .with_context(|| format!("deleting stale catalog record {:?}", work.title))?;
                removed += 1;
            }
            (added, removed)
        } else {
            info!(%run_id, "dry run: delta not applied");
            (delta.additions.len(), delta.removals.len())
        };

        let finished_at = Utc::now();
        let report_path = self
            .config
            .reports_dir
            .join(run_id.to_string())
            .join("sync_summary.json");
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            scraped: scraped_count,
            catalog_before,
            added,
            removed,
            dry_run: !apply,
            report_path: report_path.display().to_string(),
        };
        self.write_report(&summary, &report_path).await?;

        info!(
            %run_id,
            scraped = summary.scraped,
            catalog_before = summary.catalog_before,
            added = summary.added,
            removed = summary.removed,
            "sync run complete"
        );
        Ok(summary)
    }

    /// Normalize, chunk, sort, and merge the raw dataset into one sorted,
    /// deduplicated set.
    async fn build_scraped_set(&self, archive: &Path) -> Result<SortedWorks> {
        let archive = archive.to_path_buf();
        let schema = self.config.row_schema.clone();
        let chunk_size = self.config.chunk_size;

        // the row scan is blocking file I/O; chunking happens on the same
        // worker so unsorted rows never cross the thread boundary twice
        let chunks = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<Work>>> {
            let source = TsvRowSource::open(&archive)?;
            let works = source.filter_map(|row| Work::from_row(&row, &schema));
            Ok(split_into_chunks(works, chunk_size))
        })
        .await
        .context("dataset chunking worker failed")??;

        let sorted = sort_chunks(chunks).await?;
        merge_rounds(sorted).await
    }

    async fn write_report(&self, summary: &SyncRunSummary, report_path: &Path) -> Result<()> {
        if let Some(report_dir) = report_path.parent() {
            fs::create_dir_all(report_dir)
                .await
                .with_context(|| format!("creating {}", report_dir.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(report_path, bytes)
            .await
            .with_context(|| format!("writing {}", report_path.display()))?;
        Ok(())
    }
}

/// Build a pipeline from the environment, backed by the in-memory catalog
/// stand-in. Integrations with a durable store construct [`SyncPipeline`]
/// with their own [`CatalogStore`] instead.
pub fn pipeline_from_env() -> Result<Arc<SyncPipeline>> {
    let config = SyncConfig::from_env();
    Ok(Arc::new(SyncPipeline::new(
        config,
        Arc::new(MemoryCatalog::new()),
    )?))
}

/// Run the pipeline on the configured cron schedule until interrupted.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let job_pipeline = pipeline.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = job_pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.added,
                    removed = summary.removed,
                    "scheduled sync completed"
                ),
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    Ok(())
}

pub async fn run_scheduled_from_env() -> Result<()> {
    run_scheduled(pipeline_from_env()?).await
}
