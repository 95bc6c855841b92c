//! Aggregation pipeline: loads the mirrored datasets from the blob store, computes the
//! three reports and hands the finished run to the configured sinks.

pub mod aggregate;
pub mod readers;
pub mod sinks;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statsync_core::{InvocationResult, Reports, RowSkip};
use statsync_storage::{BlobStore, StoreError};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use aggregate::{
    best_year_per_series, compute_reports, joined_report, population_summary, ReportConfig,
};
pub use readers::{read_population, read_time_series, Loaded, ReadError};
pub use sinks::{BlobReportSink, ParquetReportSink, ReportSink};

pub const CRATE_NAME: &str = "statsync-analytics";

const SKIP_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportPipelineConfig {
    /// Key of the time-series object read on every run.
    pub time_series_key: String,
    /// A changed key triggers a run only when it starts with this prefix and ends with
    /// `watch_suffix`. The changed key itself is read as the population document.
    pub watch_prefix: String,
    pub watch_suffix: String,
    #[serde(flatten)]
    pub report: ReportConfig,
}

impl Default for ReportPipelineConfig {
    fn default() -> Self {
        Self {
            time_series_key: "bls-data/pr.data.0.Current".to_string(),
            watch_prefix: "api-data/".to_string(),
            watch_suffix: ".json".to_string(),
            report: ReportConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report requested for bucket {actual:?} but the store serves {expected:?}")]
    BucketMismatch { expected: String, actual: String },
    #[error("no dataset could be loaded (time series: {time_series}; population: {population})")]
    NoData {
        time_series: String,
        population: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetLoad {
    pub key: String,
    pub rows: usize,
    pub skipped: usize,
    /// First few skipped rows, for the log and the result details.
    pub skipped_samples: Vec<RowSkip>,
    pub error: Option<String>,
}

impl DatasetLoad {
    fn loaded<T>(key: &str, loaded: &Loaded<T>) -> Self {
        Self {
            key: key.to_string(),
            rows: loaded.rows.len(),
            skipped: loaded.skipped.len(),
            skipped_samples: loaded.skipped.iter().take(SKIP_SAMPLE_LIMIT).cloned().collect(),
            error: None,
        }
    }

    fn failed(key: &str, error: String) -> Self {
        Self {
            key: key.to_string(),
            rows: 0,
            skipped: 0,
            skipped_samples: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRun {
    pub run_id: Uuid,
    pub bucket: String,
    pub trigger_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub time_series: DatasetLoad,
    pub population: DatasetLoad,
    pub reports: Reports,
    pub sink_errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ReportOutcome {
    /// The changed key is outside the watched prefix and suffix.
    Ignored { key: String },
    Completed(Box<ReportRun>),
}

pub struct ReportPipeline {
    store: Arc<dyn BlobStore>,
    config: ReportPipelineConfig,
    op_timeout: Duration,
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl ReportPipeline {
    pub fn new(store: Arc<dyn BlobStore>, config: ReportPipelineConfig) -> Self {
        Self {
            store,
            config,
            op_timeout: Duration::from_secs(60),
            sinks: Vec::new(),
        }
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &ReportPipelineConfig {
        &self.config
    }

    pub fn watches(&self, key: &str) -> bool {
        key.starts_with(&self.config.watch_prefix) && key.ends_with(&self.config.watch_suffix)
    }

    /// Trigger entry point: never returns an error, the outcome is folded into the result.
    pub async fn run_report(&self, bucket: &str, key: &str) -> InvocationResult {
        let run_id = Uuid::new_v4();
        match self.run(run_id, bucket, key).await {
            Ok(ReportOutcome::Ignored { key }) => InvocationResult::success(
                run_id,
                format!("ignored {key}: not a watched population object"),
                serde_json::Value::Null,
            ),
            Ok(ReportOutcome::Completed(run)) => {
                let message = format!(
                    "report complete: {} series, {} joined rows",
                    run.reports.best_year_per_series.len(),
                    run.reports.joined_report.len()
                );
                match serde_json::to_value(&*run) {
                    Ok(details) => InvocationResult::success(run_id, message, details),
                    Err(error) => {
                        InvocationResult::failure(run_id, format!("serializing report: {error}"))
                    }
                }
            }
            Err(error) => {
                warn!(%run_id, %error, "report run failed");
                InvocationResult::failure(run_id, error.to_string())
            }
        }
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        bucket: &str,
        key: &str,
    ) -> Result<ReportOutcome, ReportError> {
        let span = info_span!("report_run", %run_id, bucket, key);
        self.run_inner(run_id, bucket, key).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        bucket: &str,
        key: &str,
    ) -> Result<ReportOutcome, ReportError> {
        if bucket != self.store.bucket() {
            return Err(ReportError::BucketMismatch {
                expected: self.store.bucket().to_string(),
                actual: bucket.to_string(),
            });
        }
        if !self.watches(key) {
            info!("key not watched; nothing to do");
            return Ok(ReportOutcome::Ignored {
                key: key.to_string(),
            });
        }

        let started_at = Utc::now();
        let ts_key = self.config.time_series_key.as_str();

        let (time_series_rows, time_series) = match self.get(ts_key).await {
            Ok(bytes) => {
                let loaded = read_time_series(&bytes);
                let load = DatasetLoad::loaded(ts_key, &loaded);
                (loaded.rows, load)
            }
            Err(error) => (Vec::new(), DatasetLoad::failed(ts_key, error.to_string())),
        };

        let (population_rows, population) = match self.get(key).await {
            Ok(bytes) => match read_population(&bytes) {
                Ok(loaded) => {
                    let load = DatasetLoad::loaded(key, &loaded);
                    (loaded.rows, load)
                }
                Err(error) => (Vec::new(), DatasetLoad::failed(key, error.to_string())),
            },
            Err(error) => (Vec::new(), DatasetLoad::failed(key, error.to_string())),
        };

        for load in [&time_series, &population] {
            if let Some(error) = &load.error {
                warn!(key = %load.key, %error, "dataset could not be loaded");
            } else if load.skipped > 0 {
                warn!(key = %load.key, skipped = load.skipped, samples = ?load.skipped_samples, "skipped malformed rows");
            }
        }
        if let (Some(ts_error), Some(pop_error)) = (&time_series.error, &population.error) {
            return Err(ReportError::NoData {
                time_series: ts_error.clone(),
                population: pop_error.clone(),
            });
        }

        let reports = compute_reports(&time_series_rows, &population_rows, &self.config.report);
        log_reports(&reports);

        let mut run = ReportRun {
            run_id,
            bucket: bucket.to_string(),
            trigger_key: key.to_string(),
            started_at,
            finished_at: Utc::now(),
            time_series,
            population,
            reports,
            sink_errors: Vec::new(),
        };

        for sink in &self.sinks {
            if let Err(error) = bounded(self.op_timeout, sink.deliver(&run)).await {
                warn!(sink = sink.name(), error = %format!("{error:#}"), "report sink failed");
                run.sink_errors.push(format!("{}: {error:#}", sink.name()));
            }
        }

        Ok(ReportOutcome::Completed(Box::new(run)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::time::timeout(self.op_timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Backend {
                operation: "get",
                key: key.to_string(),
                message: format!("timed out after {:?}", self.op_timeout),
            }),
        }
    }
}

async fn bounded<F>(limit: Duration, future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {limit:?}"))?
}

fn log_reports(reports: &Reports) {
    let summary = &reports.population_summary;
    info!(
        year_from = summary.year_from,
        year_to = summary.year_to,
        rows = summary.row_count,
        mean = ?summary.mean_population,
        stddev = ?summary.stddev_population,
        "population summary"
    );
    for best in &reports.best_year_per_series {
        info!(series_id = %best.series_id, year = best.year, total = best.total_value, "best year");
    }
    if reports.joined_report.is_empty() {
        info!("joined report is empty");
    }
    for row in &reports.joined_report {
        info!(
            series_id = %row.series_id,
            year = row.year,
            period = %row.period,
            value = ?row.value,
            population = row.population,
            "joined row"
        );
    }
}
