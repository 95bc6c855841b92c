//! Sync orchestration: mirrors every configured target into the blob store and runs the
//! report pipeline for population objects that changed.

pub mod engine;
pub mod mirror;
pub mod targets;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use statsync_adapters::{HttpDirectoryListing, HttpJsonSource, JsonSource, RemoteListing};
use statsync_analytics::{BlobReportSink, ParquetReportSink, ReportPipeline};
use statsync_core::{InvocationResult, SyncReport};
use statsync_storage::{
    open_store, BlobStore, HttpClientConfig, HttpFetcher, PacingConfig, StoreConfig, StoreKind,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use engine::{EngineOptions, SyncEngine};
pub use mirror::{ApiMirror, MirrorOutcome};
pub use targets::{ApiTarget, DirectoryTarget, Targets};

pub const CRATE_NAME: &str = "statsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing stored objects under {prefix:?} failed: {message}")]
    StoredListing { prefix: String, message: String },
    #[error("listing remote files at {location} failed: {message}")]
    RemoteListing { location: String, message: String },
    #[error("mirroring api target {name} failed: {message}")]
    Api { name: String, message: String },
    #[error("sync did not finish within the {}s invocation budget", .budget.as_secs())]
    BudgetExceeded { budget: Duration },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub targets_file: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
    /// Optional spacing between remote requests once a burst of `concurrency` is spent.
    pub request_interval: Option<Duration>,
    pub op_timeout: Duration,
    pub invocation_budget: Duration,
    pub concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Blob prefix for stored report JSON; `None` disables the blob report sink.
    pub report_prefix: Option<String>,
    /// Local directory for Parquet snapshots; `None` disables the Parquet sink.
    pub reports_dir: Option<PathBuf>,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let bucket = env_string("STATSYNC_BUCKET", "statsync-data");
        let kind = match env_string("STATSYNC_STORE", "fs").as_str() {
            "fs" => StoreKind::Filesystem {
                root: PathBuf::from(env_string("STATSYNC_STORE_ROOT", "./data")),
            },
            "s3" => StoreKind::S3 {
                endpoint: env_optional("STATSYNC_S3_ENDPOINT"),
                region: env_optional("STATSYNC_S3_REGION"),
            },
            "memory" => StoreKind::Memory,
            other => bail!("unknown STATSYNC_STORE {other:?} (expected fs, s3 or memory)"),
        };

        Ok(Self {
            store: StoreConfig { kind, bucket },
            targets_file: PathBuf::from(env_string("STATSYNC_TARGETS_FILE", "./targets.yaml")),
            user_agent: env_string("STATSYNC_USER_AGENT", "statsync/0.1 (+ops@statsync.invalid)"),
            http_timeout: Duration::from_secs(env_parse("STATSYNC_HTTP_TIMEOUT_SECS", 30)),
            request_interval: env_optional("STATSYNC_REQUEST_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            op_timeout: Duration::from_secs(env_parse("STATSYNC_OP_TIMEOUT_SECS", 60)),
            invocation_budget: Duration::from_secs(env_parse(
                "STATSYNC_INVOCATION_BUDGET_SECS",
                900,
            )),
            concurrency: env_parse("STATSYNC_CONCURRENCY", 4usize).max(1),
            scheduler_enabled: env_flag("STATSYNC_SCHEDULER_ENABLED"),
            sync_cron: env_string("STATSYNC_SYNC_CRON", "0 0 6 * * *"),
            report_prefix: Some(env_string("STATSYNC_REPORT_PREFIX", "reports"))
                .filter(|p| !p.trim().is_empty()),
            reports_dir: env_optional("STATSYNC_REPORTS_DIR").map(PathBuf::from),
        })
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            per_host_concurrency: self.concurrency,
            pacing: self.request_interval.map(|interval| PacingConfig {
                burst: self.concurrency as u32,
                interval,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub concurrency: usize,
    pub op_timeout: Duration,
    pub invocation_budget: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            op_timeout: Duration::from_secs(60),
            invocation_budget: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub directories: Vec<SyncReport>,
    pub apis: Vec<MirrorOutcome>,
    pub target_failures: Vec<TargetFailure>,
    /// Report pipeline results for the watched keys written in this run.
    pub reports: Vec<InvocationResult>,
}

impl SyncRun {
    pub fn file_failures(&self) -> usize {
        self.directories.iter().map(|r| r.failures.len()).sum()
    }

    fn summary(&self) -> String {
        let count = |f: fn(&SyncReport) -> usize| self.directories.iter().map(f).sum::<usize>();
        format!(
            "sync complete: {} uploaded, {} updated, {} deleted, {} unchanged, {} api changes, {} file failures",
            count(|r| r.uploaded().count()),
            count(|r| r.updated().count()),
            count(|r| r.deleted.len()),
            count(|r| r.unchanged.len()),
            self.apis.iter().filter(|a| a.changed()).count(),
            self.file_failures(),
        )
    }
}

struct DirectoryJob {
    target: DirectoryTarget,
    listing: Arc<dyn RemoteListing>,
}

pub struct SyncService {
    store: Arc<dyn BlobStore>,
    pipeline: Arc<ReportPipeline>,
    json: Arc<dyn JsonSource>,
    directories: Vec<DirectoryJob>,
    apis: Vec<ApiTarget>,
    options: ServiceOptions,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn BlobStore>,
        pipeline: Arc<ReportPipeline>,
        json: Arc<dyn JsonSource>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            pipeline,
            json,
            directories: Vec::new(),
            apis: Vec::new(),
            options,
        }
    }

    pub fn with_directory(mut self, target: DirectoryTarget, listing: Arc<dyn RemoteListing>) -> Self {
        self.directories.push(DirectoryJob { target, listing });
        self
    }

    pub fn with_api(mut self, target: ApiTarget) -> Self {
        self.apis.push(target);
        self
    }

    /// Wires the store, HTTP transport, targets and report sinks described by `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = open_store(&config.store).await?;
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config()).context("building http client")?,
        );
        let targets = Targets::load(&config.targets_file)?;

        let mut pipeline = ReportPipeline::new(store.clone(), targets.report.clone())
            .with_op_timeout(config.op_timeout);
        if let Some(prefix) = &config.report_prefix {
            pipeline = pipeline.with_sink(Arc::new(BlobReportSink::new(store.clone(), prefix)));
        }
        if let Some(dir) = &config.reports_dir {
            pipeline = pipeline.with_sink(Arc::new(ParquetReportSink::new(dir)));
        }

        let options = ServiceOptions {
            concurrency: config.concurrency,
            op_timeout: config.op_timeout,
            invocation_budget: config.invocation_budget,
        };
        let json = Arc::new(HttpJsonSource::new(http.clone()));
        let mut service = Self::new(store, Arc::new(pipeline), json, options);
        for target in targets.directories {
            let listing = Arc::new(HttpDirectoryListing::new(&target.listing_url, http.clone()));
            service = service.with_directory(target, listing);
        }
        for target in targets.apis {
            service = service.with_api(target);
        }
        info!(
            bucket = service.store.bucket(),
            directories = service.directories.len(),
            apis = service.apis.len(),
            "sync service configured"
        );
        Ok(service)
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<ReportPipeline> {
        &self.pipeline
    }

    /// Scheduled trigger entry point. Fatal errors and target failures become a failure
    /// status; per-file failures are reported in the details of a success.
    pub async fn run_sync(&self) -> InvocationResult {
        let run_id = Uuid::new_v4();
        match self.run_once(run_id).await {
            Ok(run) => {
                let details = serde_json::to_value(&run).unwrap_or_else(|error| {
                    serde_json::json!({ "serialization_error": error.to_string() })
                });
                if run.target_failures.is_empty() {
                    InvocationResult::success(run_id, run.summary(), details)
                } else {
                    let names = run
                        .target_failures
                        .iter()
                        .map(|f| f.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    let mut result = InvocationResult::failure(
                        run_id,
                        format!("sync failed for {names}; {}", run.summary()),
                    );
                    result.details = details;
                    result
                }
            }
            Err(error) => {
                warn!(%run_id, %error, "sync run aborted");
                InvocationResult::failure(run_id, error.to_string())
            }
        }
    }

    /// Runs every target once inside the invocation budget. Work still in flight when the
    /// budget runs out is dropped.
    pub async fn run_once(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        let budget = self.options.invocation_budget;
        let span = info_span!("sync_run", %run_id, bucket = self.store.bucket());
        tokio::time::timeout(budget, self.run_targets(run_id).instrument(span))
            .await
            .map_err(|_| SyncError::BudgetExceeded { budget })
    }

    async fn run_targets(&self, run_id: Uuid) -> SyncRun {
        let started_at = Utc::now();
        let mut run = SyncRun {
            run_id,
            started_at,
            finished_at: started_at,
            directories: Vec::new(),
            apis: Vec::new(),
            target_failures: Vec::new(),
            reports: Vec::new(),
        };

        for job in &self.directories {
            let options = EngineOptions {
                target: job.target.name.clone(),
                prefix: job.target.prefix.clone(),
                concurrency: self.options.concurrency,
                op_timeout: self.options.op_timeout,
            };
            let engine = SyncEngine::new(self.store.clone(), job.listing.clone(), options);
            match engine.sync().await {
                Ok(report) => run.directories.push(report),
                Err(error) => {
                    warn!(target = %job.target.name, %error, "directory target failed");
                    run.target_failures.push(TargetFailure {
                        name: job.target.name.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        let mirror = ApiMirror::new(self.store.clone(), self.json.clone(), self.options.op_timeout);
        for target in &self.apis {
            match mirror.mirror(target).await {
                Ok(outcome) => run.apis.push(outcome),
                Err(error) => {
                    warn!(target = %target.name, %error, "api target failed");
                    run.target_failures.push(TargetFailure {
                        name: target.name.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        let written_keys = run
            .directories
            .iter()
            .flat_map(|report| report.written_keys())
            .chain(run.apis.iter().filter(|a| a.changed()).map(|a| a.key.as_str()))
            .filter(|key| self.pipeline.watches(key))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        for key in written_keys {
            info!(%key, "watched object changed; running report");
            run.reports
                .push(self.pipeline.run_report(self.store.bucket(), &key).await);
        }

        run.finished_at = Utc::now();
        info!(summary = %run.summary(), "sync run finished");
        run
    }

    /// Builds the cron scheduler when enabled. The caller starts it.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        enabled: bool,
        cron: &str,
    ) -> Result<Option<JobScheduler>> {
        if !enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let service = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                let result = service.run_sync().await;
                info!(status = ?result.status, message = %result.message, "scheduled sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use statsync_adapters::{AdapterError, JsonSource, RemoteListing};
    use statsync_core::FileId;
    use statsync_storage::{BlobStore, MemoryBlobStore, StoreError};

    enum Script {
        Body(Vec<u8>),
        Fail,
        Slow(Duration),
    }

    /// In-memory remote listing with injectable failures.
    #[derive(Default)]
    pub struct ScriptedListing {
        files: BTreeMap<String, Script>,
        fail_listing: bool,
    }

    impl ScriptedListing {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_file(mut self, id: &str, body: &str) -> Self {
            self.files
                .insert(id.to_string(), Script::Body(body.as_bytes().to_vec()));
            self
        }

        pub fn with_failing_file(mut self, id: &str) -> Self {
            self.files.insert(id.to_string(), Script::Fail);
            self
        }

        pub fn with_slow_file(mut self, id: &str, delay: Duration) -> Self {
            self.files.insert(id.to_string(), Script::Slow(delay));
            self
        }

        pub fn failing_listing(mut self) -> Self {
            self.fail_listing = true;
            self
        }
    }

    #[async_trait]
    impl RemoteListing for ScriptedListing {
        fn location(&self) -> String {
            "scripted://listing".to_string()
        }

        async fn list_remote(&self) -> Result<BTreeSet<FileId>, AdapterError> {
            if self.fail_listing {
                return Err(AdapterError::Message("listing unavailable".into()));
            }
            Ok(self.files.keys().cloned().collect())
        }

        async fn fetch_remote(&self, file_id: &str) -> Result<Vec<u8>, AdapterError> {
            match self.files.get(file_id) {
                Some(Script::Body(body)) => Ok(body.clone()),
                Some(Script::Slow(delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Vec::new())
                }
                Some(Script::Fail) | None => {
                    Err(AdapterError::Message(format!("{file_id}: connection reset")))
                }
            }
        }
    }

    /// Memory store whose get/put/delete fail for selected keys.
    pub struct FaultyStore {
        inner: MemoryBlobStore,
        failing_gets: BTreeSet<String>,
        failing_puts: BTreeSet<String>,
        failing_deletes: BTreeSet<String>,
    }

    impl FaultyStore {
        pub fn new(inner: MemoryBlobStore) -> Self {
            Self {
                inner,
                failing_gets: BTreeSet::new(),
                failing_puts: BTreeSet::new(),
                failing_deletes: BTreeSet::new(),
            }
        }

        pub fn failing_get(mut self, key: &str) -> Self {
            self.failing_gets.insert(key.to_string());
            self
        }

        pub fn failing_put(mut self, key: &str) -> Self {
            self.failing_puts.insert(key.to_string());
            self
        }

        pub fn failing_delete(mut self, key: &str) -> Self {
            self.failing_deletes.insert(key.to_string());
            self
        }

        pub fn inner(&self) -> &MemoryBlobStore {
            &self.inner
        }

        fn refuse(operation: &'static str, key: &str) -> StoreError {
            StoreError::Backend {
                operation,
                key: key.to_string(),
                message: "boom".to_string(),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FaultyStore {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError> {
            self.inner.list(prefix).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            if self.failing_gets.contains(key) {
                return Err(Self::refuse("get", key));
            }
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            content_type: Option<&str>,
        ) -> Result<(), StoreError> {
            if self.failing_puts.contains(key) {
                return Err(Self::refuse("put", key));
            }
            self.inner.put(key, body, content_type).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            if self.failing_deletes.contains(key) {
                return Err(Self::refuse("delete", key));
            }
            self.inner.delete(key).await
        }
    }

    /// JSON source whose response body can be swapped between calls.
    pub struct ScriptedJson {
        body: Mutex<Vec<u8>>,
    }

    impl ScriptedJson {
        pub fn new(body: &[u8]) -> Self {
            Self {
                body: Mutex::new(body.to_vec()),
            }
        }

        pub fn set_body(&self, body: &[u8]) {
            *self.body.lock().unwrap() = body.to_vec();
        }
    }

    #[async_trait]
    impl JsonSource for ScriptedJson {
        async fn fetch_json(&self, _url: &str) -> Result<Vec<u8>, AdapterError> {
            Ok(self.body.lock().unwrap().clone())
        }
    }
}
