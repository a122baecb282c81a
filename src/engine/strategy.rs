//! The four ways a request can be satisfied.
//!
//! Cache writes and reads on this path never fail a request: store errors
//! are logged and treated as misses.

use std::sync::Arc;
use tracing::{debug, warn};

use super::CacheEngine;
use crate::cache::{eviction, CacheEntry, Namespace, RequestKey, Served};
use crate::net::{Fetcher, NetworkError, Request, ResponseSnapshot};

/// Generic page served when a navigation fails and nothing is cached.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline. Reconnect and try again.</p></body></html>";

/// The synthesized response of last resort.
pub fn offline_response() -> ResponseSnapshot {
  ResponseSnapshot::new(503, OFFLINE_PAGE)
    .with_header("content-type", "text/html; charset=utf-8")
    .with_header("cache-control", "no-store")
}

impl CacheEngine {
  /// Cache, then network on miss. A successful fetch is stored under the
  /// exact key and, when the URL carries a query, the query-stripped key.
  pub(crate) async fn cache_first(&self, request: &Request) -> Result<Served, NetworkError> {
    let key = RequestKey::for_request(request);
    if let Some(entry) = lookup(&self.namespace, &key) {
      debug!(%key, "Cache hit");
      return Ok(Served::from_cache(entry));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(&self.namespace, &key, &response);
          if let Some(stripped) = RequestKey::stripped(request) {
            store(&self.namespace, &stripped, &response);
          }
          self.schedule_trim();
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        // A bare copy of a versioned asset beats a broken resource
        if let Some(entry) = RequestKey::stripped(request).and_then(|k| lookup(&self.namespace, &k))
        {
          debug!(url = %request.url, "Network failed, serving query-stripped entry");
          return Ok(Served::from_cache(entry));
        }
        debug!(url = %request.url, error = %e, "Cache miss and network failure");
        Err(e)
      }
    }
  }

  /// Network, then the cached copy, then the fallback document, then a
  /// synthesized offline page. Never fails.
  pub(crate) async fn network_first(&self, request: &Request) -> Served {
    let key = RequestKey::for_request(request);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(&self.namespace, &key, &response);
        }
        return Served::from_network(response);
      }
      Err(e) => debug!(url = %request.url, error = %e, "Navigation failed, trying cache"),
    }

    if let Some(entry) = lookup(&self.namespace, &key) {
      return Served::from_cache(entry);
    }
    if let Some(entry) = lookup(&self.namespace, &RequestKey::get(&self.fallback_url)) {
      debug!(url = %request.url, fallback = %self.fallback_url, "Serving fallback document");
      return Served::fallback(entry);
    }

    warn!(url = %request.url, "No cached document or fallback, serving generic offline page");
    Served::synthetic(offline_response())
  }

  /// Cached copy right away with a background refresh; without a cached
  /// copy the caller waits on the network.
  pub(crate) async fn stale_while_revalidate(
    &self,
    request: &Request,
  ) -> Result<Served, NetworkError> {
    let key = RequestKey::for_request(request);

    if let Some(entry) = lookup(&self.namespace, &key) {
      let namespace = self.namespace.clone();
      let fetcher = Arc::clone(&self.fetcher);
      let request = request.clone();
      self.spawn_background(async move {
        revalidate(namespace, fetcher, request, key).await;
      });
      return Ok(Served::from_cache(entry));
    }

    let response = self.fetcher.fetch(request).await?;
    if response.is_success() {
      store(&self.namespace, &key, &response);
    }
    Ok(Served::from_network(response))
  }

  fn schedule_trim(&self) {
    let namespace = self.namespace.clone();
    let max_entries = self.config.max_entries;
    self.spawn_background(async move {
      if let Err(e) = eviction::trim(&namespace, max_entries) {
        warn!(namespace = namespace.name(), error = %e, "Failed to trim cache namespace");
      }
    });
  }
}

async fn revalidate(
  namespace: Namespace,
  fetcher: Arc<dyn Fetcher>,
  request: Request,
  key: RequestKey,
) {
  match fetcher.fetch(&request).await {
    Ok(response) if response.is_success() => store(&namespace, &key, &response),
    Ok(response) => debug!(%key, status = response.status, "Revalidation not stored"),
    Err(e) => debug!(%key, error = %e, "Revalidation failed, keeping cached copy"),
  }
}

/// Read an entry, treating a storage failure as a miss.
fn lookup(namespace: &Namespace, key: &RequestKey) -> Option<CacheEntry> {
  match namespace.lookup(key) {
    Ok(entry) => entry,
    Err(e) => {
      warn!(%key, error = %e, "Cache read failed, treating as miss");
      None
    }
  }
}

/// Write an entry, logging and swallowing a storage failure.
fn store(namespace: &Namespace, key: &RequestKey, response: &ResponseSnapshot) {
  if let Err(e) = namespace.store(key, response) {
    warn!(%key, error = %e, "Cache write failed");
  }
}
