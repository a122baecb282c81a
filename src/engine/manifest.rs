//! The precache manifest: URLs fetched and stored at install time.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

/// Ordered list of URLs produced by the build step.
///
/// Entries may be absolute or origin-relative. Duplicated logical resources
/// (version-tagged and bare) are kept as-is so both forms end up cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StaticManifest {
  urls: Vec<String>,
}

impl StaticManifest {
  pub fn new<I, S>(urls: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      urls: urls.into_iter().map(Into::into).collect(),
    }
  }

  /// Parse a JSON array of URL strings.
  pub fn from_json(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Failed to parse precache manifest: {}", e))
  }

  pub fn from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read precache manifest {}: {}", path.display(), e))?;
    Self::from_json(&contents)
      .map_err(|e| eyre!("Invalid precache manifest {}: {}", path.display(), e))
  }

  pub fn urls(&self) -> &[String] {
    &self.urls
  }

  pub fn len(&self) -> usize {
    self.urls.len()
  }

  pub fn is_empty(&self) -> bool {
    self.urls.is_empty()
  }

  /// Resolve every entry against `origin`.
  ///
  /// Entries that do not form a URL are logged and skipped, like any other
  /// single-resource install failure.
  pub fn resolve(&self, origin: &Url) -> Vec<Url> {
    self
      .urls
      .iter()
      .filter_map(|raw| match origin.join(raw) {
        Ok(url) => Some(url),
        Err(e) => {
          warn!(entry = %raw, error = %e, "Skipping unparseable manifest entry");
          None
        }
      })
      .collect()
  }

  /// Whether some entry resolves to exactly `url`.
  pub fn contains(&self, origin: &Url, url: &Url) -> bool {
    self
      .urls
      .iter()
      .filter_map(|raw| origin.join(raw).ok())
      .any(|candidate| &candidate == url)
  }
}

/// Where an install reads its manifest from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
  Path(PathBuf),
  Inline(StaticManifest),
}

impl ManifestSource {
  /// Load the manifest. Failure here is fatal to the install.
  pub fn load(&self) -> Result<StaticManifest> {
    match self {
      Self::Path(path) => StaticManifest::from_path(path),
      Self::Inline(manifest) => Ok(manifest.clone()),
    }
  }
}

impl From<StaticManifest> for ManifestSource {
  fn from(manifest: StaticManifest) -> Self {
    Self::Inline(manifest)
  }
}
