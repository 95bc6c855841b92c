//! Blob storage backends + HTTP fetch utilities for statsync.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

mod http;
mod s3;

pub use http::{
    classify_reqwest_error, classify_status, retry_after, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, PacingConfig, RequestPacer,
    RetryDisposition,
};
pub use s3::S3BlobStore;

pub const CRATE_NAME: &str = "statsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("invalid object key {key:?}")]
    InvalidKey { key: String },
    #[error("i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} failed for {key}: {message}")]
    Backend {
        operation: &'static str,
        key: String,
        message: String,
    },
}

/// Key-value blob store bound to a single bucket.
///
/// Implementations are expected to provide read-after-write consistency.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Every key that starts with `prefix` (plain string prefix, like S3).
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Filesystem { root: PathBuf },
    S3 {
        endpoint: Option<String>,
        region: Option<String>,
    },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub bucket: String,
}

pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match &config.kind {
        StoreKind::Filesystem { root } => {
            let store = FsBlobStore::new(root, &config.bucket);
            fs::create_dir_all(store.dir())
                .await
                .with_context(|| format!("creating bucket directory {}", store.dir().display()))?;
            Arc::new(store)
        }
        StoreKind::S3 { endpoint, region } => Arc::new(
            S3BlobStore::connect(&config.bucket, endpoint.as_deref(), region.as_deref()).await,
        ),
        StoreKind::Memory => Arc::new(MemoryBlobStore::new(&config.bucket)),
    };
    Ok(store)
}

const TEMP_PREFIX: &str = ".statsync-put-";
const TEMP_SUFFIX: &str = ".tmp";

/// Bucket laid out as a directory tree under `root/bucket`, one file per key.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    bucket: String,
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        let root = root.into();
        Self {
            bucket: bucket.to_string(),
            dir: root.join(bucket),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let invalid = || StoreError::InvalidKey {
            key: key.to_string(),
        };
        if key.is_empty() || key.contains('\\') {
            return Err(invalid());
        }
        let mut path = self.dir.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(invalid());
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Only names produced by [`FsBlobStore::temp_name`] are hidden from listings.
    fn is_temp_file(name: &str) -> bool {
        name.strip_prefix(TEMP_PREFIX)
            .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
            .is_some_and(|id| Uuid::parse_str(id).is_ok())
    }

    fn temp_name() -> String {
        format!("{TEMP_PREFIX}{}{TEMP_SUFFIX}", Uuid::new_v4())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut keys = BTreeSet::new();
        let mut pending = vec![(self.dir.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StoreError::Io {
                        key: key_prefix,
                        source,
                    })
                }
            };
            loop {
                let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                    key: key_prefix.clone(),
                    source,
                })?;
                let Some(entry) = entry else {
                    break;
                };
                let name = entry.file_name().to_string_lossy().to_string();
                let key = format!("{key_prefix}{name}");
                let file_type = entry.file_type().await.map_err(|source| StoreError::Io {
                    key: key.clone(),
                    source,
                })?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if !Self::is_temp_file(&name) && key.starts_with(prefix) {
                    keys.insert(key);
                }
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Writes through a temp file in the destination directory and renames it into place.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = self.key_path(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        let parent = path.parent().unwrap_or(&self.dir).to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(Self::temp_name());
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&body).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        debug!(key, bytes = body.len(), content_type, "stored object on filesystem");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Process-local store. Counts puts and deletes so callers can observe write volume.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            ..Self::default()
        }
    }

    pub async fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.lock().await.insert(
            key.to_string(),
            MemoryObject {
                body: body.into(),
                content_type: None,
            },
        );
    }

    pub async fn object(&self, key: &str) -> Option<MemoryObject> {
        self.objects.lock().await.get(key).cloned()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|object| object.body.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().await.insert(
            key.to_string(),
            MemoryObject {
                body,
                content_type: content_type.map(ToString::to_string),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_lists_by_prefix() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "mirror");

        store
            .put("bls-data/pr.data.0.Current", b"v1".to_vec(), None)
            .await
            .expect("put data");
        store
            .put("api-data/us_population.json", b"{}".to_vec(), Some("application/json"))
            .await
            .expect("put json");

        let keys = store.list("bls-data/").await.expect("list");
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["bls-data/pr.data.0.Current".to_string()]
        );
        assert_eq!(store.list("").await.expect("list all").len(), 2);
        assert_eq!(
            store.get("bls-data/pr.data.0.Current").await.expect("get"),
            b"v1"
        );
    }

    #[tokio::test]
    async fn fs_store_overwrites_atomically_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "mirror");

        store.put("bls-data/a.txt", b"old".to_vec(), None).await.unwrap();
        store.put("bls-data/a.txt", b"new".to_vec(), None).await.unwrap();

        assert_eq!(store.get("bls-data/a.txt").await.unwrap(), b"new");
        let names = std::fs::read_dir(store.dir().join("bls-data"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn fs_store_lists_dot_tmp_objects_that_are_not_its_own_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "mirror");
        store.put("bls-data/.cache.tmp", b"c".to_vec(), None).await.unwrap();
        store.put("bls-data/.1.2.tmp", b"d".to_vec(), None).await.unwrap();
        std::fs::write(store.dir().join("bls-data").join(FsBlobStore::temp_name()), b"partial")
            .unwrap();

        let keys = store.list("bls-data/").await.unwrap();
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["bls-data/.1.2.tmp".to_string(), "bls-data/.cache.tmp".to_string()]
        );
    }

    #[tokio::test]
    async fn fs_store_missing_objects() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "mirror");

        assert!(store.list("bls-data/").await.unwrap().is_empty());
        assert!(matches!(
            store.get("bls-data/missing.txt").await,
            Err(StoreError::NotFound { .. })
        ));
        store.delete("bls-data/missing.txt").await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "mirror");
        for key in ["../escape.txt", "bls-data//x", "", "a\\b"] {
            assert!(matches!(
                store.put(key, b"x".to_vec(), None).await,
                Err(StoreError::InvalidKey { .. })
            ));
        }
    }

    #[tokio::test]
    async fn memory_store_tracks_writes_and_content_type() {
        let store = MemoryBlobStore::new("mirror");
        store
            .put("api-data/p.json", b"{}".to_vec(), Some("application/json"))
            .await
            .unwrap();
        store.delete("api-data/p.json").await.unwrap();
        store.delete("api-data/p.json").await.unwrap();

        assert_eq!(store.put_count(), 1);
        assert_eq!(store.delete_count(), 2);
        assert!(store.object("api-data/p.json").await.is_none());
    }
}
