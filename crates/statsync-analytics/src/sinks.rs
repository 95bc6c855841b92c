//! Report sinks: where a finished report run is delivered besides the invocation result.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Float32Array, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use statsync_core::Reports;
use statsync_storage::{sha256_hex, BlobStore};
use tracing::info;
use uuid::Uuid;

use crate::ReportRun;

#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, run: &ReportRun) -> Result<()>;
}

/// Stores the run as `{prefix}/{run_id}/report.json` in the blob store.
pub struct BlobReportSink {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl BlobReportSink {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn key_for(&self, run_id: Uuid) -> String {
        format!("{}/{run_id}/report.json", self.prefix)
    }
}

#[async_trait]
impl ReportSink for BlobReportSink {
    fn name(&self) -> &'static str {
        "blob"
    }

    async fn deliver(&self, run: &ReportRun) -> Result<()> {
        let key = self.key_for(run.run_id);
        let body = serde_json::to_vec_pretty(run).context("serializing report run")?;
        self.store
            .put(&key, body, Some("application/json"))
            .await
            .with_context(|| format!("storing report at {key}"))?;
        info!(key = %key, "report stored");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes one Parquet file per report plus a `manifest.json` under `{dir}/{run_id}/`.
#[derive(Debug, Clone)]
pub struct ParquetReportSink {
    dir: PathBuf,
}

impl ParquetReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReportSink for ParquetReportSink {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn deliver(&self, run: &ReportRun) -> Result<()> {
        let run_dir = self.dir.join(run.run_id.to_string());
        let reports = run.reports.clone();
        let run_id = run.run_id;
        let manifest_path = tokio::task::spawn_blocking(move || {
            export_parquet_snapshots(&run_dir, run_id, &reports)
        })
        .await
        .context("parquet export task failed")??;
        info!(manifest = %manifest_path.display(), "parquet snapshots written");
        Ok(())
    }
}

pub fn export_parquet_snapshots(dir: &Path, run_id: Uuid, reports: &Reports) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let summary_path = dir.join("population_summary.parquet");
    let best_year_path = dir.join("best_year_per_series.parquet");
    let joined_path = dir.join("joined_report.parquet");

    write_population_summary_parquet(&summary_path, reports)?;
    write_best_year_parquet(&best_year_path, reports)?;
    write_joined_report_parquet(&joined_path, reports)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("population_summary", dir, &summary_path)?,
            manifest_entry("best_year_per_series", dir, &best_year_path)?,
            manifest_entry("joined_report", dir, &joined_path)?,
        ],
    };

    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_population_summary_parquet(path: &Path, reports: &Reports) -> Result<()> {
    let summary = &reports.population_summary;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("year_from", DataType::Int32, false),
        ArrowField::new("year_to", DataType::Int32, false),
        ArrowField::new("row_count", DataType::UInt64, false),
        ArrowField::new("mean_population", DataType::Float64, true),
        ArrowField::new("stddev_population", DataType::Float64, true),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int32Array::from(vec![summary.year_from])),
            Arc::new(Int32Array::from(vec![summary.year_to])),
            Arc::new(UInt64Array::from(vec![summary.row_count as u64])),
            Arc::new(Float64Array::from(vec![summary.mean_population])),
            Arc::new(Float64Array::from(vec![summary.stddev_population])),
        ],
    )
    .context("building population_summary record batch")?;
    write_parquet(path, batch)
}

fn write_best_year_parquet(path: &Path, reports: &Reports) -> Result<()> {
    let rows = &reports.best_year_per_series;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("series_id", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("total_value", DataType::Float64, false),
    ]));

    let series_ids = StringArray::from(rows.iter().map(|r| r.series_id.as_str()).collect::<Vec<_>>());
    let years = Int32Array::from(rows.iter().map(|r| r.year).collect::<Vec<_>>());
    let totals = Float64Array::from(rows.iter().map(|r| r.total_value).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(series_ids), Arc::new(years), Arc::new(totals)],
    )
    .context("building best_year_per_series record batch")?;
    write_parquet(path, batch)
}

fn write_joined_report_parquet(path: &Path, reports: &Reports) -> Result<()> {
    let rows = &reports.joined_report;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("series_id", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("value", DataType::Float32, true),
        ArrowField::new("population", DataType::Int64, false),
    ]));

    let series_ids = StringArray::from(rows.iter().map(|r| r.series_id.as_str()).collect::<Vec<_>>());
    let years = Int32Array::from(rows.iter().map(|r| r.year).collect::<Vec<_>>());
    let periods = StringArray::from(rows.iter().map(|r| r.period.as_str()).collect::<Vec<_>>());
    let values = Float32Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>());
    let populations = Int64Array::from(rows.iter().map(|r| r.population).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(series_ids),
            Arc::new(years),
            Arc::new(periods),
            Arc::new(values),
            Arc::new(populations),
        ],
    )
    .context("building joined_report record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use statsync_core::{BestYearRecord, JoinedReportRow, PopulationSummary};
    use tempfile::tempdir;

    fn sample_reports() -> Reports {
        Reports {
            population_summary: PopulationSummary {
                year_from: 2013,
                year_to: 2018,
                row_count: 1,
                mean_population: Some(311536594.0),
                stddev_population: None,
            },
            best_year_per_series: vec![
                BestYearRecord {
                    series_id: "PRS30006011".into(),
                    year: 2018,
                    total_value: 4.0,
                },
                BestYearRecord {
                    series_id: "PRS30006032".into(),
                    year: 2022,
                    total_value: 5.3,
                },
            ],
            joined_report: vec![JoinedReportRow {
                series_id: "PRS30006032".into(),
                year: 2013,
                period: "Q01".into(),
                value: None,
                population: 311536594,
            }],
        }
    }

    fn parquet_rows(path: &Path) -> usize {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|batch| batch.unwrap().num_rows())
            .sum()
    }

    #[test]
    fn parquet_snapshots_and_manifest_are_written() {
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let manifest_path = export_parquet_snapshots(&run_dir, Uuid::new_v4(), &sample_reports()).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f["sha256"].as_str().unwrap().len() == 64));

        assert_eq!(parquet_rows(&run_dir.join("population_summary.parquet")), 1);
        assert_eq!(parquet_rows(&run_dir.join("best_year_per_series.parquet")), 2);
        assert_eq!(parquet_rows(&run_dir.join("joined_report.parquet")), 1);
    }

    #[test]
    fn empty_reports_still_produce_files() {
        let dir = tempdir().unwrap();
        let mut reports = sample_reports();
        reports.best_year_per_series.clear();
        reports.joined_report.clear();

        export_parquet_snapshots(dir.path(), Uuid::new_v4(), &reports).unwrap();
        assert_eq!(parquet_rows(&dir.path().join("joined_report.parquet")), 0);
    }
}
