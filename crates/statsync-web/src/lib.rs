//! HTTP trigger surface for the sync service and the report pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use statsync_core::InvocationResult;
use statsync_sync::{SyncConfig, SyncService};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "statsync-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub bucket: String,
    pub key: String,
}

/// Subset of an S3 event notification: `Records[].s3.bucket.name` and `Records[].s3.object.key`.
#[derive(Debug, Deserialize)]
pub struct ObjectEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<ObjectEventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEventRecord {
    pub s3: ObjectEventEntity,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEventEntity {
    pub bucket: NamedBucket,
    pub object: EventObject,
}

#[derive(Debug, Deserialize)]
pub struct NamedBucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct EventObject {
    pub key: String,
}

#[derive(Debug, Serialize)]
struct Health<'a> {
    status: &'a str,
    bucket: &'a str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_handler))
        .route("/report", post(report_handler))
        .route("/events/object-created", post(object_event_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("STATSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

/// Builds the service, starts the scheduler when enabled and serves until the listener fails.
pub async fn serve(config: SyncConfig, port: u16) -> anyhow::Result<()> {
    let service = Arc::new(SyncService::from_config(&config).await?);

    let scheduler = service
        .maybe_build_scheduler(config.scheduler_enabled, &config.sync_cron)
        .await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "trigger server listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(Health {
        status: "ok",
        bucket: state.service.store().bucket(),
    })
    .into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    invocation_response(state.service.run_sync().await)
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReportRequest>,
) -> Response {
    let result = state
        .service
        .pipeline()
        .run_report(&request.bucket, &request.key)
        .await;
    invocation_response(result)
}

/// One pipeline run per record; 500 if any record failed.
async fn object_event_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ObjectEvent>,
) -> Response {
    let mut results = Vec::with_capacity(event.records.len());
    for record in &event.records {
        let key = decode_event_key(&record.s3.object.key);
        results.push(
            state
                .service
                .pipeline()
                .run_report(&record.s3.bucket.name, &key)
                .await,
        );
    }
    let status = if results.iter().all(InvocationResult::is_success) {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(results)).into_response()
}

fn invocation_response(result: InvocationResult) -> Response {
    let status =
        StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(result)).into_response()
}

/// Object keys in event notifications are form-encoded (`+` for space, `%XX` escapes).
pub fn decode_event_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
