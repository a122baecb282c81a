//! Core types for cached entries and served results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::net::ResponseSnapshot;

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub response: ResponseSnapshot,
  /// When the snapshot was written
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(response: ResponseSnapshot) -> Self {
    Self {
      response,
      stored_at: Utc::now(),
    }
  }
}

/// Result of an intercepted request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The response handed back to the caller
  pub response: ResponseSnapshot,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response from the network.
  pub fn from_network(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Entry matched for the request itself.
  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Cache,
      cached_at: Some(entry.stored_at),
    }
  }

  /// The designated fallback document stood in for the request.
  pub fn fallback(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Fallback,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Response generated by the engine itself.
  pub fn synthetic(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Stored entry for this request (exact or query-stripped key)
  Cache,
  /// The fallback document, served for a failed navigation
  Fallback,
  /// Generic offline page built in memory
  Synthetic,
}
