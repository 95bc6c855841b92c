//! Core domain model for statsync: sync plans, dataset rows and report shapes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statsync-core";

/// Identifier (filename) of one file in a remote directory listing.
pub type FileId = String;

/// Builds the blob key `{prefix}/{file_id}`. An empty prefix maps ids to keys directly.
pub fn object_key(prefix: &str, file_id: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_id.to_string()
    } else {
        format!("{prefix}/{file_id}")
    }
}

/// Inverse of [`object_key`]. Keys outside the namespace, or nested below it, yield `None`.
pub fn file_id_from_key(prefix: &str, key: &str) -> Option<FileId> {
    let prefix = prefix.trim_end_matches('/');
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Upload,
    Update,
    Unchanged,
    Delete,
}

/// Decides what to do with one remote file given the currently stored bytes, if any.
///
/// Comparison is byte-for-byte over the full content; identical content is never
/// classified as an update.
pub fn classify(remote: &[u8], stored: Option<&[u8]>) -> FileAction {
    match stored {
        None => FileAction::Upload,
        Some(current) if current == remote => FileAction::Unchanged,
        Some(_) => FileAction::Update,
    }
}

/// Upload/update/delete sets computed for a single sync invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPlan {
    pub to_upload: BTreeSet<FileId>,
    pub to_update: BTreeSet<FileId>,
    pub to_delete: BTreeSet<FileId>,
}

impl SyncPlan {
    /// Starts a plan with `to_delete = stored - remote`.
    pub fn with_deletions(stored: &BTreeSet<FileId>, remote: &BTreeSet<FileId>) -> Self {
        Self {
            to_delete: stored.difference(remote).cloned().collect(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, file_id: &str, action: FileAction) {
        match action {
            FileAction::Upload => {
                self.to_upload.insert(file_id.to_string());
            }
            FileAction::Update => {
                self.to_update.insert(file_id.to_string());
            }
            FileAction::Delete => {
                self.to_delete.insert(file_id.to_string());
            }
            FileAction::Unchanged => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Fetching the remote bytes.
    Fetch,
    /// Reading the currently stored bytes.
    Read,
    /// Writing new bytes to the store.
    Write,
    Delete,
}

/// A per-file failure. Recorded in the report; never aborts the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub file_id: FileId,
    pub stage: FailureStage,
    pub reason: String,
}

/// Object written during a sync, with the digest of the bytes that landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenObject {
    pub file_id: FileId,
    pub key: String,
    pub action: FileAction,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub target: String,
    pub prefix: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub remote_files: usize,
    pub stored_files: usize,
    pub plan: SyncPlan,
    pub written: Vec<WrittenObject>,
    pub deleted: Vec<FileId>,
    pub unchanged: Vec<FileId>,
    pub failures: Vec<FileFailure>,
}

impl SyncReport {
    pub fn uploaded(&self) -> impl Iterator<Item = &WrittenObject> {
        self.written.iter().filter(|w| w.action == FileAction::Upload)
    }

    pub fn updated(&self) -> impl Iterator<Item = &WrittenObject> {
        self.written.iter().filter(|w| w.action == FileAction::Update)
    }

    /// Keys uploaded or updated in this run. Deleted keys are not included.
    pub fn written_keys(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(|w| w.key.as_str())
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One line of the tab-delimited time-series file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRow {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    /// `None` when the source field is not a finite number. Excluded from sums, never zero.
    pub value: Option<f32>,
    pub footnote_codes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationRow {
    pub year: i32,
    pub population: i64,
}

/// A row that was skipped while reading a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSkip {
    /// 1-based line number for delimited input, 0-based element index for JSON input.
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestYearRecord {
    pub series_id: String,
    pub year: i32,
    pub total_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationSummary {
    pub year_from: i32,
    pub year_to: i32,
    pub row_count: usize,
    /// `None` when no rows fall in the window.
    pub mean_population: Option<f64>,
    /// Sample standard deviation; `None` when fewer than two rows fall in the window.
    pub stddev_population: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedReportRow {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    pub value: Option<f32>,
    pub population: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reports {
    pub population_summary: PopulationSummary,
    pub best_year_per_series: Vec<BestYearRecord>,
    pub joined_report: Vec<JoinedReportRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failure,
}

/// Structured result handed back to whatever triggered a sync or report run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub run_id: Uuid,
    pub status: InvocationStatus,
    pub status_code: u16,
    pub message: String,
    pub details: serde_json::Value,
}

impl InvocationResult {
    pub fn success(run_id: Uuid, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            run_id,
            status: InvocationStatus::Success,
            status_code: 200,
            message: message.into(),
            details,
        }
    }

    pub fn failure(run_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status: InvocationStatus::Failure,
            status_code: 500,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> BTreeSet<FileId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keys_round_trip_through_namespace() {
        assert_eq!(object_key("bls-data", "pr.txt"), "bls-data/pr.txt");
        assert_eq!(object_key("bls-data/", "pr.txt"), "bls-data/pr.txt");
        assert_eq!(object_key("", "pr.txt"), "pr.txt");
        assert_eq!(file_id_from_key("bls-data", "bls-data/pr.txt").as_deref(), Some("pr.txt"));
        assert_eq!(file_id_from_key("bls-data", "api-data/x.json"), None);
        assert_eq!(file_id_from_key("bls-data", "bls-data-old/pr.txt"), None);
        assert_eq!(file_id_from_key("bls-data", "bls-data/nested/pr.txt"), None);
    }

    #[test]
    fn identical_content_is_never_an_update() {
        assert_eq!(classify(b"same", Some(b"same")), FileAction::Unchanged);
        assert_eq!(classify(b"new", Some(b"old")), FileAction::Update);
        assert_eq!(classify(b"x", None), FileAction::Upload);
    }

    #[test]
    fn deletions_are_plain_set_difference() {
        let plan = SyncPlan::with_deletions(&ids(&["a.txt", "b.txt"]), &ids(&["b.txt", "c.txt"]));
        assert_eq!(plan.to_delete, ids(&["a.txt"]));
        assert!(plan.to_upload.is_empty());
        assert!(!plan.is_empty());
    }

    #[test]
    fn written_keys_exclude_deletions() {
        let written = |id: &str, action| WrittenObject {
            file_id: id.to_string(),
            key: object_key("bls-data", id),
            action,
            sha256: String::new(),
            byte_size: 0,
        };
        let now = Utc::now();
        let report = SyncReport {
            run_id: Uuid::new_v4(),
            target: "bls".into(),
            prefix: "bls-data".into(),
            started_at: now,
            finished_at: now,
            remote_files: 2,
            stored_files: 2,
            plan: SyncPlan::default(),
            written: vec![
                written("b.txt", FileAction::Update),
                written("c.txt", FileAction::Upload),
            ],
            deleted: vec!["a.txt".to_string()],
            unchanged: Vec::new(),
            failures: Vec::new(),
        };

        assert_eq!(
            report.written_keys().collect::<Vec<_>>(),
            vec!["bls-data/b.txt", "bls-data/c.txt"]
        );
        assert_eq!(report.uploaded().count(), 1);
    }

    #[test]
    fn failure_result_carries_500() {
        let result = InvocationResult::failure(Uuid::new_v4(), "listing failed");
        assert!(!result.is_success());
        assert_eq!(result.status_code, 500);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
    }
}
