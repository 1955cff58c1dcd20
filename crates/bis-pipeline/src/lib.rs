//! Linkage pipeline orchestration: fetch the four sources, normalize identifiers,
//! aggregate, merge onto the footprint base, derive flags, and write the master
//! CSV plus per-run reports.

pub mod aggregate;
pub mod flags;
pub mod leads;
pub mod merge;
pub mod registry;
pub mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bis_adapters::{csv_file_adapter, paged_json_adapter, AdapterContext, SourceAdapter, SourceKind};
use bis_core::normalize_identifiers;
use bis_storage::{
    read_frame_csv, write_frame_csv, ArtifactStore, HttpClientConfig, HttpFetcher, RateLimit,
};
use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use aggregate::{
    aggregate_permits, aggregate_sales, AggregateStats, PermitAggregateConfig, SaleAggregateConfig,
};
pub use flags::{apply_derived_flags, DerivedFlagConfig};
pub use leads::{score_leads, top_leads, LeadScoreConfig, RenovationSummary};
pub use merge::{left_join, merge_master, JoinKey, JoinStepStats, MasterInputs, MergeError};
pub use registry::{LinkageSettings, RegistryError, SourceConfig, SourceRegistry, SourceRole};
pub use report::{recent_runs_markdown, RunRecord, SourceLoadStats};

pub const CRATE_NAME: &str = "bis-pipeline";
pub const MASTER_FILE_NAME: &str = "properties_master.csv";
pub const TOP_LEADS_FILE_NAME: &str = "top_leads.csv";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub output_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rate_limit_per_sec: Option<u32>,
    /// Read every API source from its `backup_csv` instead of the network.
    pub offline: bool,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl PipelineConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            sources_path: workspace_root.join("sources.yaml"),
            output_dir: workspace_root.join("data/processed"),
            artifacts_dir: workspace_root.join("artifacts"),
            reports_dir: workspace_root.join("reports"),
            user_agent: "bis-bot/0.1".to_string(),
            http_timeout_secs: 60,
            rate_limit_per_sec: None,
            offline: false,
            scheduler_enabled: false,
            refresh_cron: "0 0 5 * * *".to_string(),
            workspace_root,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("BIS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        // an absolute value replaces the root on join
        let path_var = |var: &str, default: &str| {
            workspace_root.join(std::env::var(var).unwrap_or_else(|_| default.to_string()))
        };
        Self {
            sources_path: path_var("BIS_SOURCES_FILE", "sources.yaml"),
            output_dir: path_var("BIS_OUTPUT_DIR", "data/processed"),
            artifacts_dir: path_var("BIS_ARTIFACTS_DIR", "artifacts"),
            reports_dir: path_var("BIS_REPORTS_DIR", "reports"),
            user_agent: std::env::var("BIS_USER_AGENT").unwrap_or_else(|_| "bis-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("BIS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            rate_limit_per_sec: std::env::var("BIS_RATE_LIMIT_PER_SEC")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0),
            offline: env_flag("BIS_OFFLINE"),
            scheduler_enabled: env_flag("BIS_SCHEDULER_ENABLED"),
            refresh_cron: std::env::var("BIS_REFRESH_CRON").unwrap_or_else(|_| "0 0 5 * * *".to_string()),
            workspace_root,
        }
    }

    pub fn master_path(&self) -> PathBuf {
        self.output_dir.join(MASTER_FILE_NAME)
    }

    /// Registry paths (`path`, `backup_csv`) are relative to the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.workspace_root.join(path)
    }
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// The four normalized source frames, one per role.
#[derive(Debug, Clone, Default)]
pub struct SourceFrames {
    pub footprints: DataFrame,
    pub parcels: DataFrame,
    pub permits: DataFrame,
    pub sales: DataFrame,
}

#[derive(Debug, Clone)]
pub struct MasterBuild {
    pub master: DataFrame,
    pub permits: AggregateStats,
    pub sales: AggregateStats,
    pub joins: Vec<JoinStepStats>,
}

/// Aggregate permits and sales, merge everything onto the footprints, then derive
/// the flag columns. No I/O.
pub fn build_master(frames: &SourceFrames, settings: &LinkageSettings) -> Result<MasterBuild, MergeError> {
    let (permits, permit_stats) = aggregate_permits(&frames.permits, &settings.permits)?;
    let (sales, sale_stats) = aggregate_sales(&frames.sales, &settings.sales)?;
    let (merged, joins) = merge_master(&MasterInputs {
        base: &frames.footprints,
        parcels: &frames.parcels,
        permits: &permits,
        sales: &sales,
    })?;
    let master = apply_derived_flags(&merged, &settings.flags)?;
    merge::check_row_count(frames.footprints.height(), master.height())?;
    Ok(MasterBuild {
        master,
        permits: permit_stats,
        sales: sale_stats,
        joins,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub master_path: String,
    pub master_rows: usize,
    pub status: String,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

struct LoadedSource {
    frame: DataFrame,
    stats: SourceLoadStats,
}

pub struct Pipeline {
    config: PipelineConfig,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            rate_limit: config.rate_limit_per_sec.map(RateLimit::per_second),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            artifact_store,
            http,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        let path = &self.config.sources_path;
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// One full run. The master CSV is only replaced once every source loaded and
    /// the row count matched the footprint base.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_registry().await?;
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        info!(%run_id, offline = self.config.offline, "linkage run started");

        let (footprints, parcels, permits, sales) = tokio::try_join!(
            self.load_role(&registry, SourceRole::Footprints, &ctx),
            self.load_role(&registry, SourceRole::Parcels, &ctx),
            self.load_role(&registry, SourceRole::Permits, &ctx),
            self.load_role(&registry, SourceRole::Sales, &ctx),
        )?;
        let sources = vec![
            footprints.stats,
            parcels.stats,
            permits.stats,
            sales.stats,
        ];
        let frames = SourceFrames {
            footprints: footprints.frame,
            parcels: parcels.frame,
            permits: permits.frame,
            sales: sales.frame,
        };

        let build = build_master(&frames, &registry.linkage).context("building master frame")?;
        let master_path = self.config.master_path();
        write_frame_csv(&master_path, &build.master)
            .await
            .with_context(|| format!("writing {}", master_path.display()))?;
        info!(path = %master_path.display(), rows = build.master.height(), "master frame written");

        let truncated = sources.iter().any(|s| s.truncated);
        if truncated {
            warn!(%run_id, "one or more sources hit their page cap; master is partial");
        }
        let finished_at = Utc::now();
        let record = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: if truncated { "partial" } else { "completed" }.to_string(),
            master_path: master_path.display().to_string(),
            master_rows: build.master.height(),
            master_columns: build.master.width(),
            renovation: RenovationSummary::from_master(&build.master, &registry.linkage.flags)?,
            sources,
            permits: build.permits,
            sales: build.sales,
            joins: build.joins,
        };
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        report::write_run_reports(&reports_dir, &record).await?;
        let manifest_path =
            report::export_parquet_snapshots(&reports_dir, run_id, &build.master, &record.sources).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            master_path: record.master_path,
            master_rows: record.master_rows,
            status: record.status,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    /// Fetch and normalize a single source into `<output_dir>/<source_id>.csv`.
    pub async fn fetch_source(&self, source_id: &str) -> Result<(PathBuf, SourceLoadStats)> {
        let registry = self.load_registry().await?;
        let source = registry.get(source_id)?;
        let ctx = AdapterContext::new(Uuid::new_v4());
        let loaded = self.load_source(source, &ctx).await?;
        let path = self.config.output_dir.join(format!("{source_id}.csv"));
        write_frame_csv(&path, &loaded.frame)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok((path, loaded.stats))
    }

    pub async fn load_master(&self) -> Result<DataFrame> {
        let path = self.config.master_path();
        read_frame_csv(&path)
            .await
            .with_context(|| format!("reading {} (run `build` first)", path.display()))
    }

    pub async fn renovation_report(&self) -> Result<RenovationSummary> {
        let registry = self.load_registry().await?;
        let master = self.load_master().await?;
        Ok(RenovationSummary::from_master(&master, &registry.linkage.flags)?)
    }

    /// Scores the master frame and writes the leads at or above `min_score`
    /// (the registry's `leads.min_score` when `None`).
    pub async fn write_top_leads(&self, min_score: Option<u32>) -> Result<(PathBuf, usize)> {
        let registry = self.load_registry().await?;
        let master = self.load_master().await?;
        let scored = score_leads(&master, &registry.leads)?;
        let min_score = min_score.unwrap_or(registry.leads.min_score);
        let leads = top_leads(&scored, &registry.leads, min_score)?;
        let path = self.config.output_dir.join(TOP_LEADS_FILE_NAME);
        write_frame_csv(&path, &leads)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), leads = leads.height(), min_score, "top leads written");
        Ok((path, leads.height()))
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.master_rows,
                        "scheduled run complete"
                    ),
                    Err(err) => error!("scheduled run failed: {err:#}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_role(
        &self,
        registry: &SourceRegistry,
        role: SourceRole,
        ctx: &AdapterContext,
    ) -> Result<LoadedSource> {
        let source = registry.for_role(role)?;
        self.load_source(source, ctx).await
    }

    async fn load_source(&self, source: &SourceConfig, ctx: &AdapterContext) -> Result<LoadedSource> {
        let (adapter, from_backup) = self.adapter_for(source)?;
        let fetched = adapter
            .fetch(&self.http, ctx)
            .await
            .with_context(|| format!("fetching {}", adapter.source_id()))?;

        // Local CSV reads are not archived; the file itself is the artifact.
        let mut stored_artifacts = 0usize;
        if adapter.kind() != SourceKind::Csv {
            for page in &fetched.pages {
                self.artifact_store
                    .store_page(adapter.source_id(), page.fetched_at, page.extension(), &page.body)
                    .await
                    .with_context(|| format!("storing raw page {}", page.url))?;
                stored_artifacts += 1;
            }
        }

        let raw = source.rename_columns(adapter.parse(&fetched.pages)?)?;
        let (frame, normalize) = normalize_identifiers(adapter.source_id(), &raw, &source.schema)?;
        info!(
            source_id = %adapter.source_id(),
            role = %source.role,
            pages = fetched.pages.len(),
            truncated = fetched.truncated,
            raw_rows = raw.height(),
            kept = normalize.output_rows,
            rejected = normalize.rejected(),
            "source loaded"
        );
        Ok(LoadedSource {
            stats: SourceLoadStats {
                source_id: adapter.source_id().to_string(),
                role: source.role,
                kind: source.kind,
                from_backup,
                pages: fetched.pages.len(),
                stored_artifacts,
                raw_rows: raw.height(),
                normalize,
                truncated: fetched.truncated,
            },
            frame,
        })
    }

    fn adapter_for(&self, source: &SourceConfig) -> Result<(Box<dyn SourceAdapter>, bool)> {
        if self.config.offline && source.kind != SourceKind::Csv {
            let backup = source
                .backup_csv
                .as_deref()
                .with_context(|| format!("source {} has no backup_csv for offline runs", source.source_id))?;
            return Ok((csv_file_adapter(&source.source_id, self.config.resolve(backup)), true));
        }
        match (source.kind, &source.endpoint, &source.path) {
            (SourceKind::Csv, _, Some(path)) => Ok((
                csv_file_adapter(&source.source_id, self.config.resolve(path)),
                false,
            )),
            (SourceKind::Csv, _, None) => bail!("source {} has kind csv but no path", source.source_id),
            (kind, Some(endpoint), _) => Ok((
                paged_json_adapter(&source.source_id, kind, endpoint.clone())?,
                false,
            )),
            (kind, None, _) => bail!("source {} has kind {kind:?} but no endpoint", source.source_id),
        }
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    Pipeline::new(PipelineConfig::from_env())?.run_once().await
}

/// Runs the refresh job on `refresh_cron` until Ctrl-C.
pub async fn run_scheduler(mut config: PipelineConfig) -> Result<()> {
    config.scheduler_enabled = true;
    let cron = config.refresh_cron.clone();
    let pipeline = Arc::new(Pipeline::new(config)?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler was not built");
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
