//! Mirrors a JSON API response into a single blob, rewriting it only when it changed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use statsync_adapters::{normalize_json, JsonSource};
use statsync_core::{classify, FileAction};
use statsync_storage::{sha256_hex, BlobStore, StoreError};
use tracing::{info, info_span, Instrument};

use crate::engine::bounded;
use crate::targets::ApiTarget;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorOutcome {
    pub name: String,
    pub key: String,
    pub action: FileAction,
    pub sha256: String,
    pub byte_size: usize,
}

impl MirrorOutcome {
    pub fn changed(&self) -> bool {
        self.action != FileAction::Unchanged
    }
}

pub struct ApiMirror {
    store: Arc<dyn BlobStore>,
    source: Arc<dyn JsonSource>,
    op_timeout: Duration,
}

impl ApiMirror {
    pub fn new(store: Arc<dyn BlobStore>, source: Arc<dyn JsonSource>, op_timeout: Duration) -> Self {
        Self {
            store,
            source,
            op_timeout,
        }
    }

    pub async fn mirror(&self, target: &ApiTarget) -> Result<MirrorOutcome, SyncError> {
        let span = info_span!("api_mirror", name = %target.name, key = %target.key);
        self.mirror_inner(target).instrument(span).await
    }

    async fn mirror_inner(&self, target: &ApiTarget) -> Result<MirrorOutcome, SyncError> {
        let api_error = |message: String| SyncError::Api {
            name: target.name.clone(),
            message,
        };

        let raw = bounded(self.op_timeout, self.source.fetch_json(&target.url))
            .await
            .map_err(api_error)?;
        let body = normalize_json(&target.url, &raw).map_err(|e| api_error(e.to_string()))?;

        let stored = match tokio::time::timeout(self.op_timeout, self.store.get(&target.key)).await {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(StoreError::NotFound { .. })) => None,
            Ok(Err(error)) => return Err(api_error(error.to_string())),
            Err(_) => return Err(api_error(format!("reading {} timed out", target.key))),
        };

        let action = classify(&body, stored.as_deref());
        let outcome = MirrorOutcome {
            name: target.name.clone(),
            key: target.key.clone(),
            action,
            sha256: sha256_hex(&body),
            byte_size: body.len(),
        };
        if !outcome.changed() {
            info!("api response unchanged");
            return Ok(outcome);
        }

        bounded(
            self.op_timeout,
            self.store.put(&target.key, body, Some("application/json")),
        )
        .await
        .map_err(api_error)?;
        info!(action = ?outcome.action, sha256 = %outcome.sha256, bytes = outcome.byte_size, "api response stored");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedJson;
    use statsync_storage::MemoryBlobStore;

    fn target() -> ApiTarget {
        ApiTarget {
            name: "us-population".into(),
            url: "https://api.test/population".into(),
            key: "api-data/us_population.json".into(),
        }
    }

    #[tokio::test]
    async fn stores_pretty_json_once() {
        let store = Arc::new(MemoryBlobStore::new("bucket"));
        let source = Arc::new(ScriptedJson::new(br#"{"data":[{"Year":"2019","Population":1}]}"#));
        let mirror = ApiMirror::new(store.clone(), source.clone(), Duration::from_secs(5));

        let first = mirror.mirror(&target()).await.unwrap();
        assert_eq!(first.action, FileAction::Upload);
        let object = store.object("api-data/us_population.json").await.unwrap();
        assert_eq!(object.content_type.as_deref(), Some("application/json"));
        assert!(String::from_utf8(object.body).unwrap().contains("\n    \"data\""));

        // same document with different whitespace
        source.set_body(b"{ \"data\": [ {\"Year\": \"2019\", \"Population\": 1} ] }");
        let second = mirror.mirror(&target()).await.unwrap();
        assert_eq!(second.action, FileAction::Unchanged);
        assert_eq!(store.put_count(), 1);

        source.set_body(br#"{"data":[{"Year":"2020","Population":2}]}"#);
        let third = mirror.mirror(&target()).await.unwrap();
        assert_eq!(third.action, FileAction::Update);
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn non_json_response_is_rejected_without_writing() {
        let store = Arc::new(MemoryBlobStore::new("bucket"));
        let source = Arc::new(ScriptedJson::new(b"<html>maintenance</html>"));
        let mirror = ApiMirror::new(store.clone(), source, Duration::from_secs(5));

        let error = mirror.mirror(&target()).await.unwrap_err();
        assert!(matches!(error, SyncError::Api { .. }));
        assert_eq!(store.put_count(), 0);
    }
}
