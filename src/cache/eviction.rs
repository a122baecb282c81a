//! Size bound for a namespace.
//!
//! Deletes the oldest-listed keys once the namespace holds more than the
//! bound. Listing order comes from the storage backend and is only an
//! approximation of insertion order; the namespace is dropped wholesale on
//! every version change, so the bound only caps growth within one version.

use color_eyre::Result;
use tracing::debug;

use super::storage::Namespace;

/// Trim `namespace` down to at most `max_entries` keys.
///
/// Returns how many entries this call removed. Concurrent trims may race to
/// delete the same keys; deletes are idempotent so the bound still holds.
pub fn trim(namespace: &Namespace, max_entries: usize) -> Result<usize> {
  let keys = namespace.keys()?;
  if keys.len() <= max_entries {
    return Ok(0);
  }

  let excess = keys.len() - max_entries;
  let mut removed = 0;
  for key in keys.iter().take(excess) {
    if namespace.remove(key)? {
      removed += 1;
    }
  }

  debug!(
    namespace = namespace.name(),
    removed, max_entries, "Trimmed cache namespace"
  );
  Ok(removed)
}
