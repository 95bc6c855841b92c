//! Directory Sync Engine: reconciles one remote listing with one prefix of the blob store.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use statsync_adapters::RemoteListing;
use statsync_core::{
    classify, file_id_from_key, object_key, FailureStage, FileAction, FileFailure, FileId,
    SyncPlan, SyncReport, WrittenObject,
};
use statsync_storage::{sha256_hex, BlobStore, StoreError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Name used in logs and the report.
    pub target: String,
    pub prefix: String,
    /// Upper bound on files processed at once. `1` runs the files sequentially.
    pub concurrency: usize,
    /// Applied to every list/fetch/get/put/delete call.
    pub op_timeout: Duration,
}

impl EngineOptions {
    pub fn new(target: &str, prefix: &str) -> Self {
        Self {
            target: target.to_string(),
            prefix: prefix.to_string(),
            concurrency: 4,
            op_timeout: Duration::from_secs(60),
        }
    }
}

enum FileResult {
    Written(WrittenObject),
    Unchanged(FileId),
    Failed {
        failure: FileFailure,
        planned: Option<FileAction>,
    },
}

pub struct SyncEngine {
    store: Arc<dyn BlobStore>,
    remote: Arc<dyn RemoteListing>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteListing>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            remote,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// One reconciliation pass. Only a failure to list either side is returned as an
    /// error; per-file problems are recorded in the report.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "directory_sync",
            %run_id,
            target = %self.options.target,
            prefix = %self.options.prefix
        );
        self.sync_inner(run_id).instrument(span).await
    }

    async fn sync_inner(&self, run_id: Uuid) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let prefix = self.options.prefix.as_str();
        let limit = self.options.op_timeout;

        let stored_keys = bounded(limit, self.store.list(&list_prefix(prefix)))
            .await
            .map_err(|message| SyncError::StoredListing {
                prefix: prefix.to_string(),
                message,
            })?;
        let stored: BTreeSet<FileId> = stored_keys
            .iter()
            .filter_map(|key| file_id_from_key(prefix, key))
            .collect();

        let remote = bounded(limit, self.remote.list_remote())
            .await
            .map_err(|message| SyncError::RemoteListing {
                location: self.remote.location(),
                message,
            })?;
        info!(remote = remote.len(), stored = stored.len(), "listings loaded");

        let mut plan = SyncPlan::with_deletions(&stored, &remote);
        let concurrency = self.options.concurrency.max(1);

        let file_syncs: Vec<_> = remote
            .iter()
            .map(|file_id| self.sync_file(file_id, stored.contains(file_id)))
            .collect();
        let results = stream::iter(file_syncs)
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut written = Vec::new();
        let mut unchanged = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                FileResult::Written(object) => {
                    plan.record(&object.file_id, object.action);
                    written.push(object);
                }
                FileResult::Unchanged(file_id) => unchanged.push(file_id),
                FileResult::Failed { failure, planned } => {
                    if let Some(action) = planned {
                        plan.record(&failure.file_id, action);
                    }
                    failures.push(failure);
                }
            }
        }

        let file_deletes: Vec<_> = plan
            .to_delete
            .iter()
            .map(|file_id| self.delete_file(file_id))
            .collect();
        let deletions = stream::iter(file_deletes)
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        let mut deleted = Vec::new();
        for result in deletions {
            match result {
                Ok(file_id) => deleted.push(file_id),
                Err(failure) => failures.push(failure),
            }
        }

        written.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        unchanged.sort();
        deleted.sort();
        failures.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        let report = SyncReport {
            run_id,
            target: self.options.target.clone(),
            prefix: prefix.to_string(),
            started_at,
            finished_at: Utc::now(),
            remote_files: remote.len(),
            stored_files: stored.len(),
            plan,
            written,
            deleted,
            unchanged,
            failures,
        };
        info!(
            uploaded = report.uploaded().count(),
            updated = report.updated().count(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged.len(),
            failures = report.failures.len(),
            "directory sync finished"
        );
        Ok(report)
    }

    /// fetch, compare, then write only when the bytes differ.
    async fn sync_file(&self, file_id: &FileId, is_stored: bool) -> FileResult {
        let limit = self.options.op_timeout;
        let key = object_key(&self.options.prefix, file_id);
        let failed = |stage, reason: String, planned| {
            warn!(file_id = %file_id, stage = ?stage, %reason, "file sync failed");
            FileResult::Failed {
                failure: FileFailure {
                    file_id: file_id.clone(),
                    stage,
                    reason,
                },
                planned,
            }
        };

        let remote_bytes = match bounded(limit, self.remote.fetch_remote(file_id)).await {
            Ok(bytes) => bytes,
            Err(reason) => return failed(FailureStage::Fetch, reason, None),
        };

        let stored_bytes = if is_stored {
            match tokio::time::timeout(limit, self.store.get(&key)).await {
                Ok(Ok(bytes)) => Some(bytes),
                // removed between list and get: treat as absent
                Ok(Err(StoreError::NotFound { .. })) => None,
                Ok(Err(error)) => return failed(FailureStage::Read, error.to_string(), None),
                Err(_) => {
                    return failed(FailureStage::Read, timeout_message(limit), None);
                }
            }
        } else {
            None
        };

        let action = classify(&remote_bytes, stored_bytes.as_deref());
        if action == FileAction::Unchanged {
            debug!(file_id = %file_id, "unchanged");
            return FileResult::Unchanged(file_id.clone());
        }

        let sha256 = sha256_hex(&remote_bytes);
        let byte_size = remote_bytes.len();
        if let Err(reason) = bounded(limit, self.store.put(&key, remote_bytes, None)).await {
            return failed(FailureStage::Write, reason, Some(action));
        }
        info!(file_id = %file_id, key = %key, action = ?action, sha256 = %sha256, bytes = byte_size, "object written");
        FileResult::Written(WrittenObject {
            file_id: file_id.clone(),
            key,
            action,
            sha256,
            byte_size,
        })
    }

    async fn delete_file(&self, file_id: &FileId) -> Result<FileId, FileFailure> {
        let key = object_key(&self.options.prefix, file_id);
        match bounded(self.options.op_timeout, self.store.delete(&key)).await {
            Ok(()) => {
                info!(file_id = %file_id, key = %key, "object deleted");
                Ok(file_id.clone())
            }
            Err(reason) => {
                warn!(file_id = %file_id, %reason, "delete failed");
                Err(FileFailure {
                    file_id: file_id.clone(),
                    stage: FailureStage::Delete,
                    reason,
                })
            }
        }
    }
}

/// Store prefix used for listing, so `data` does not also match `data-old/...`.
fn list_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    }
}

fn timeout_message(limit: Duration) -> String {
    format!("timed out after {}s", limit.as_secs_f64())
}

/// Runs one collaborator call under `limit`, flattening timeout and error into a message.
pub(crate) async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, String>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(timeout_message(limit)),
    }
}
