//! Namespace naming and purging of previous cache generations.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, Namespace};

/// Outcome of a purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
  /// Namespaces that were deleted
  pub deleted: Vec<String>,
  /// Namespaces whose deletion failed; retried on the next activation
  pub failed: Vec<String>,
}

/// Names the active cache generation and removes older ones.
#[derive(Clone)]
pub struct VersionManager {
  storage: Arc<dyn CacheStorage>,
  prefix: String,
  version: String,
}

impl VersionManager {
  pub fn new(storage: Arc<dyn CacheStorage>, prefix: &str, version: &str) -> Self {
    Self {
      storage,
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  /// `prefix + version`
  pub fn current_name(&self) -> String {
    format!("{}{}", self.prefix, self.version)
  }

  /// Handle to the current namespace, without creating it.
  pub fn current(&self) -> Namespace {
    Namespace::new(self.storage.clone(), &self.current_name())
  }

  pub fn open_current(&self) -> Result<Namespace> {
    Namespace::open(self.storage.clone(), &self.current_name())
  }

  /// Delete every namespace carrying this prefix except the current one.
  ///
  /// Namespaces with other prefixes belong to someone else and are left
  /// alone. A failed deletion is logged and does not stop the pass.
  pub fn purge(&self) -> Result<PurgeReport> {
    self.purge_except(&[])
  }

  /// `purge`, also sparing the namespaces named in `keep`.
  pub fn purge_except(&self, keep: &[String]) -> Result<PurgeReport> {
    let current = self.current_name();
    let mut report = PurgeReport::default();

    for name in self.storage.namespace_names()? {
      if name == current || !name.starts_with(&self.prefix) || keep.contains(&name) {
        continue;
      }
      match self.storage.delete_namespace(&name) {
        Ok(_) => {
          info!(namespace = %name, "Deleted stale cache namespace");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(namespace = %name, error = %e, "Failed to delete stale cache namespace");
          report.failed.push(name);
        }
      }
    }

    Ok(report)
  }
}
