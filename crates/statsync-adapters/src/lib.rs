//! Remote collaborator contracts: the scraped directory listing and the JSON API.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Serialize;
use statsync_core::FileId;
use statsync_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "statsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("listing {location} failed: {source}")]
    Listing {
        location: String,
        #[source]
        source: FetchError,
    },
    #[error("fetching {file_id} failed: {source}")]
    File {
        file_id: FileId,
        #[source]
        source: FetchError,
    },
    #[error("fetching {url} failed: {source}")]
    Api {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("response from {url} is not valid JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// A remote set of files that can be enumerated and fetched one by one.
#[async_trait]
pub trait RemoteListing: Send + Sync {
    /// Human-readable location, used in logs and reports.
    fn location(&self) -> String;

    async fn list_remote(&self) -> Result<BTreeSet<FileId>, AdapterError>;

    async fn fetch_remote(&self, file_id: &str) -> Result<Vec<u8>, AdapterError>;
}

/// A JSON document served over HTTP.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<Vec<u8>, AdapterError>;
}

/// Directory index page (Apache/IIS style) whose anchors name the files below it.
#[derive(Debug, Clone)]
pub struct HttpDirectoryListing {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl HttpDirectoryListing {
    pub fn new(base_url: &str, http: Arc<HttpFetcher>) -> Self {
        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url, http }
    }

    pub fn file_url(&self, file_id: &str) -> String {
        format!("{}{}", self.base_url, file_id)
    }
}

#[async_trait]
impl RemoteListing for HttpDirectoryListing {
    fn location(&self) -> String {
        self.base_url.clone()
    }

    async fn list_remote(&self) -> Result<BTreeSet<FileId>, AdapterError> {
        let page = self
            .http
            .fetch_bytes(&self.base_url)
            .await
            .map_err(|source| AdapterError::Listing {
                location: self.base_url.clone(),
                source,
            })?;
        let html = String::from_utf8_lossy(&page.body);
        let files = parse_directory_index(&html)?;
        debug!(location = %self.base_url, files = files.len(), "parsed directory index");
        Ok(files)
    }

    async fn fetch_remote(&self, file_id: &str) -> Result<Vec<u8>, AdapterError> {
        let response = self
            .http
            .fetch_bytes(&self.file_url(file_id))
            .await
            .map_err(|source| AdapterError::File {
                file_id: file_id.to_string(),
                source,
            })?;
        Ok(response.body)
    }
}

/// Anchor texts that name a file: not a bracketed navigation entry such as
/// `[To Parent Directory]`, not a relative path component, and carrying an extension.
pub fn is_file_entry(text: &str) -> bool {
    !text.is_empty()
        && !matches!(text, "." | "..")
        && !text.starts_with('[')
        && text.contains('.')
        && !text.contains('/')
}

pub fn parse_directory_index(html: &str) -> Result<BTreeSet<FileId>, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a").map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&anchors)
        .map(|a| a.text().collect::<String>().trim().to_string())
        .filter(|text| is_file_entry(text))
        .collect())
}

/// Serves a local directory as if it were the remote listing. Used for offline runs
/// against captured fixtures.
#[derive(Debug, Clone)]
pub struct FixtureDirectoryListing {
    dir: PathBuf,
}

impl FixtureDirectoryListing {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RemoteListing for FixtureDirectoryListing {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    async fn list_remote(&self) -> Result<BTreeSet<FileId>, AdapterError> {
        let io_err = |source| AdapterError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut files = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                if is_file_entry(&name) {
                    files.insert(name);
                }
            }
        }
        Ok(files)
    }

    async fn fetch_remote(&self, file_id: &str) -> Result<Vec<u8>, AdapterError> {
        let path = self.dir.join(file_id);
        fs::read(&path)
            .await
            .map_err(|source| AdapterError::Io { path, source })
    }
}

#[derive(Debug, Clone)]
pub struct HttpJsonSource {
    http: Arc<HttpFetcher>,
}

impl HttpJsonSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl JsonSource for HttpJsonSource {
    async fn fetch_json(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let response = self
            .http
            .fetch_bytes(url)
            .await
            .map_err(|source| AdapterError::Api {
                url: url.to_string(),
                source,
            })?;
        Ok(response.body)
    }
}

/// Re-encodes a JSON document with four-space indentation so stored bytes are stable
/// across fetches that differ only in whitespace. Object keys keep the response order.
pub fn normalize_json(url: &str, bytes: &[u8]) -> Result<Vec<u8>, AdapterError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|source| AdapterError::InvalidJson {
            url: url.to_string(),
            source,
        })?;
    let mut out = Vec::with_capacity(bytes.len());
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|source| AdapterError::InvalidJson {
            url: url.to_string(),
            source,
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn directory_index_keeps_only_file_entries() {
        let html = std::fs::read_to_string(workspace_root().join("fixtures/bls-pr/listing.html"))
            .expect("listing fixture");
        let files = parse_directory_index(&html).unwrap();

        assert_eq!(files.len(), 11);
        assert!(files.contains("pr.data.0.Current"));
        assert!(files.contains("pr.txt"));
        assert!(!files.iter().any(|f| f.starts_with('[')));
        assert!(!files.contains("archive"));
    }

    #[test]
    fn file_entry_filter() {
        assert!(is_file_entry("pr.class"));
        assert!(!is_file_entry("[To Parent Directory]"));
        assert!(!is_file_entry("archive"));
        assert!(!is_file_entry(""));
        assert!(!is_file_entry("."));
        assert!(!is_file_entry(".."));
        assert!(is_file_entry(".cache.tmp"));
    }

    #[test]
    fn json_is_normalized_with_four_space_indent() {
        let out = normalize_json("test://api", br#"{"data":[{"Year":"2019"}]}"#).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "{\n    \"data\": [\n        {\n            \"Year\": \"2019\"\n        }\n    ]\n}"
        );
        assert!(matches!(
            normalize_json("test://api", b"<html>503</html>"),
            Err(AdapterError::InvalidJson { .. })
        ));
    }

    #[test]
    fn normalized_json_keeps_response_key_order() {
        let out = normalize_json("test://api", br#"{"Year":"2019","Population":1,"ID Nation":"01000US"}"#)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\n    \"Year\": \"2019\",\n    \"Population\": 1,\n    \"ID Nation\": \"01000US\"\n}"
        );
    }

    #[tokio::test]
    async fn fixture_listing_serves_local_files() {
        let listing = FixtureDirectoryListing::new(workspace_root().join("fixtures/bls-pr"));
        let files = listing.list_remote().await.unwrap();
        assert!(files.contains("pr.data.0.Current"));
        assert!(files.contains("listing.html"));

        let bytes = listing.fetch_remote("pr.data.0.Current").await.unwrap();
        assert!(bytes.starts_with(b"series_id"));
        assert!(matches!(
            listing.fetch_remote("missing.txt").await,
            Err(AdapterError::Io { .. })
        ));
    }
}
