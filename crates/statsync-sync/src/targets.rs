//! What to mirror: directory listings, JSON APIs and the report watched by the pipeline.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use statsync_analytics::ReportPipelineConfig;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryTarget {
    pub name: String,
    pub listing_url: String,
    /// Store prefix the listing is mirrored under.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTarget {
    pub name: String,
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub directories: Vec<DirectoryTarget>,
    #[serde(default)]
    pub apis: Vec<ApiTarget>,
    #[serde(default)]
    pub report: ReportPipelineConfig,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            directories: vec![DirectoryTarget {
                name: "bls-pr".to_string(),
                listing_url: "https://download.bls.gov/pub/time.series/pr/".to_string(),
                prefix: "bls-data".to_string(),
            }],
            apis: vec![ApiTarget {
                name: "us-population".to_string(),
                url: "https://datausa.io/api/data?drilldowns=Nation&measures=Population"
                    .to_string(),
                key: "api-data/us_population.json".to_string(),
            }],
            report: ReportPipelineConfig::default(),
        }
    }
}

impl Targets {
    /// Reads the targets file, falling back to the built-in targets when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "targets file not found; using built-in targets");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let targets: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        targets
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(targets)
    }

    /// Two directory targets sharing a prefix would delete each other's files.
    pub fn validate(&self) -> Result<()> {
        let mut prefixes = std::collections::BTreeSet::new();
        for dir in &self.directories {
            let prefix = dir.prefix.trim_end_matches('/');
            if !prefixes.insert(prefix) {
                bail!("directory prefix {prefix:?} is used by more than one target");
            }
        }
        for api in &self.apis {
            if api.key.is_empty() || api.key.ends_with('/') {
                bail!("api target {} has invalid key {:?}", api.name, api.key);
            }
            if prefixes.iter().any(|p| {
                p.is_empty() || api.key.starts_with(&format!("{p}/"))
            }) {
                bail!(
                    "api target {} key {:?} lies inside a mirrored directory prefix",
                    api.name,
                    api.key
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_uses_builtin_targets() {
        let dir = tempdir().unwrap();
        let targets = Targets::load(&dir.path().join("targets.yaml")).unwrap();
        assert_eq!(targets, Targets::default());
        assert_eq!(targets.report.time_series_key, "bls-data/pr.data.0.Current");
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("targets.yaml");
        std::fs::write(
            &path,
            "directories:\n  - name: cu\n    listing_url: https://example.test/cu/\n    prefix: cu-data\nreport:\n  series_id: CUUR0000SA0\n  year_from: 2000\n",
        )
        .unwrap();

        let targets = Targets::load(&path).unwrap();
        assert_eq!(targets.directories.len(), 1);
        assert!(targets.apis.is_empty());
        assert_eq!(targets.report.report.series_id, "CUUR0000SA0");
        assert_eq!(targets.report.report.year_from, 2000);
        assert_eq!(targets.report.report.year_to, 2018);
        assert_eq!(targets.report.watch_prefix, "api-data/");
    }

    #[test]
    fn rejects_overlapping_prefixes() {
        let mut targets = Targets::default();
        targets.directories.push(DirectoryTarget {
            name: "dup".into(),
            listing_url: "https://example.test/".into(),
            prefix: "bls-data/".into(),
        });
        assert!(targets.validate().is_err());

        let mut targets = Targets::default();
        targets.apis[0].key = "bls-data/population.json".into();
        assert!(targets.validate().is_err());
    }
}
