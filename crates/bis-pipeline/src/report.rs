//! Per-run reports: `run_summary.md`, `run.json`, and parquet snapshots with a
//! hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bis_adapters::SourceKind;
use bis_core::{text_cells, NormalizeStats};
use bis_storage::sha256_hex;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::aggregate::AggregateStats;
use crate::leads::RenovationSummary;
use crate::merge::JoinStepStats;
use crate::registry::SourceRole;

pub const RUN_SUMMARY_FILE: &str = "run_summary.md";
pub const RUN_RECORD_FILE: &str = "run.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoadStats {
    pub source_id: String,
    pub role: SourceRole,
    pub kind: SourceKind,
    /// `true` when the rows came from `backup_csv` instead of the endpoint.
    pub from_backup: bool,
    pub pages: usize,
    pub stored_artifacts: usize,
    pub raw_rows: usize,
    pub normalize: NormalizeStats,
    /// The fetch stopped at the configured page cap; rows are incomplete.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub master_path: String,
    pub master_rows: usize,
    pub master_columns: usize,
    pub sources: Vec<SourceLoadStats>,
    pub permits: AggregateStats,
    pub sales: AggregateStats,
    pub joins: Vec<JoinStepStats>,
    pub renovation: RenovationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub fn render_run_summary(record: &RunRecord) -> String {
    let mut lines = vec![
        "# Property Linkage Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", record.run_id),
        format!("- Started: {}", record.started_at),
        format!("- Finished: {}", record.finished_at),
        format!(
            "- Master: `{}` ({} rows, {} columns)",
            record.master_path, record.master_rows, record.master_columns
        ),
        format!("- Status: {}", record.status),
    ];
    let truncated: Vec<&str> = record
        .sources
        .iter()
        .filter(|s| s.truncated)
        .map(|s| s.source_id.as_str())
        .collect();
    if !truncated.is_empty() {
        lines.push(format!(
            "- WARNING: page cap reached for {}; the master is built from partial data",
            truncated.join(", ")
        ));
    }
    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &record.sources {
        lines.push(format!(
            "- {} ({}, {:?}{}): {} raw rows, {} kept, {} bad BIN, {} bad BBL{}",
            source.source_id,
            source.role,
            source.kind,
            if source.from_backup { ", backup" } else { "" },
            source.raw_rows,
            source.normalize.output_rows,
            source.normalize.rejected_bin,
            source.normalize.rejected_bbl,
            if source.truncated { ", TRUNCATED" } else { "" },
        ));
    }
    lines.push(String::new());
    lines.push("## Aggregates".to_string());
    for (label, stats) in [("permits", &record.permits), ("sales", &record.sales)] {
        lines.push(format!(
            "- {label}: {} keys from {} rows ({} excluded){}",
            stats.output_rows,
            stats.input_rows,
            stats.excluded_rows,
            if stats.degraded { ", degraded" } else { "" },
        ));
    }
    lines.push(String::new());
    lines.push("## Joins".to_string());
    for join in &record.joins {
        let mut line = format!(
            "- {} on {}: {} matched",
            join.label,
            join.key.column(),
            join.matched_rows
        );
        if !join.dropped_columns.is_empty() {
            line.push_str(&format!(", dropped {}", join.dropped_columns.join(", ")));
        }
        if join.duplicate_keys > 0 {
            line.push_str(&format!(", {} duplicate keys ignored", join.duplicate_keys));
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.push(record.renovation.to_markdown());
    lines.join("\n")
}

pub async fn write_run_reports(reports_dir: &Path, record: &RunRecord) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    fs::write(reports_dir.join(RUN_SUMMARY_FILE), render_run_summary(record))
        .await
        .with_context(|| format!("writing {RUN_SUMMARY_FILE}"))?;
    let json = serde_json::to_vec_pretty(record).context("serializing run record")?;
    fs::write(reports_dir.join(RUN_RECORD_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_RECORD_FILE}"))?;
    Ok(())
}

/// Writes `master.parquet` and `sources.parquet` under `<reports_dir>/snapshots`
/// and returns the manifest path.
pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    run_id: Uuid,
    master: &DataFrame,
    sources: &[SourceLoadStats],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let master_path = snapshot_dir.join("master.parquet");
    let sources_path = snapshot_dir.join("sources.parquet");
    write_parquet(&master_path, frame_batch(master)?)?;
    write_parquet(&sources_path, sources_batch(sources)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("master", reports_dir, &master_path, master.height())?,
            manifest_entry("sources", reports_dir, &sources_path, sources.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Every column becomes a nullable Utf8 field; typed columns (flags, scores)
/// are written in their CSV text form.
pub fn frame_batch(frame: &DataFrame) -> Result<RecordBatch> {
    let names = frame.get_column_names();
    let fields = names
        .iter()
        .map(|name| ArrowField::new(*name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    let arrays = names
        .iter()
        .map(|name| -> Result<ArrayRef> {
            let values = text_cells(frame, name).with_context(|| format!("reading column {name}"))?;
            Ok(Arc::new(StringArray::from(values)) as ArrayRef)
        })
        .collect::<Result<Vec<_>>>()?;
    if arrays.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::new(fields))));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("building master record batch")
}

fn sources_batch(sources: &[SourceLoadStats]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("role", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("from_backup", DataType::Boolean, false),
        ArrowField::new("raw_rows", DataType::UInt64, false),
        ArrowField::new("kept_rows", DataType::UInt64, false),
        ArrowField::new("rejected_rows", DataType::UInt64, false),
        ArrowField::new("truncated", DataType::Boolean, false),
    ]));

    let source_ids = StringArray::from(
        sources
            .iter()
            .map(|s| Some(s.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let roles = StringArray::from(sources.iter().map(|s| Some(s.role.as_str())).collect::<Vec<_>>());
    let kinds = StringArray::from(
        sources
            .iter()
            .map(|s| Some(format!("{:?}", s.kind).to_ascii_lowercase()))
            .collect::<Vec<_>>(),
    );
    let from_backup = BooleanArray::from(sources.iter().map(|s| s.from_backup).collect::<Vec<_>>());
    let raw_rows = UInt64Array::from(sources.iter().map(|s| s.raw_rows as u64).collect::<Vec<_>>());
    let kept_rows = UInt64Array::from(
        sources
            .iter()
            .map(|s| s.normalize.output_rows as u64)
            .collect::<Vec<_>>(),
    );
    let rejected = UInt64Array::from(
        sources
            .iter()
            .map(|s| s.normalize.rejected() as u64)
            .collect::<Vec<_>>(),
    );
    let truncated = BooleanArray::from(sources.iter().map(|s| s.truncated).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(roles),
            Arc::new(kinds),
            Arc::new(from_backup),
            Arc::new(raw_rows),
            Arc::new(kept_rows),
            Arc::new(rejected),
            Arc::new(truncated),
        ],
    )
    .context("building sources record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing parquet batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: path.strip_prefix(reports_dir).unwrap_or(path).display().to_string(),
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Markdown listing of the most recent `runs` reports under `reports_root`.
pub fn recent_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(RUN_RECORD_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Linkage Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let record_path = dir.path().join(RUN_RECORD_FILE);
        let record: RunRecord = serde_json::from_str(
            &std::fs::read_to_string(&record_path)
                .with_context(|| format!("reading {}", record_path.display()))?,
        )
        .with_context(|| format!("parsing {}", record_path.display()))?;

        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- finished: {}", record.finished_at));
        lines.push(format!("- status: {}", record.status));
        lines.push(format!("- master rows: {}", record.master_rows));
        lines.push(format!(
            "- renovated within {} days: {:.1}%",
            record.renovation.window_days, record.renovation.pct_renovated
        ));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
