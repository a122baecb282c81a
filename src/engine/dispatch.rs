//! Request classification. Decides a route before any I/O happens.

use reqwest::Method;
use url::{Origin, Url};

use crate::net::{Destination, Request};

/// How an intercepted request is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Never intercepted: not a GET, or not same-origin
  Bypass(BypassReason),
  /// Page loads: network, then cache, then fallback document
  NetworkFirst,
  /// The metadata manifest: cached copy now, refresh in background
  StaleWhileRevalidate,
  /// Static assets: cache, network only on miss
  CacheFirst,
  /// Straight to network, neither cached nor inspected
  NetworkOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
  NonGet,
  CrossOrigin,
}

/// Classifies requests against one origin.
#[derive(Debug, Clone)]
pub struct Dispatcher {
  origin: Origin,
  metadata_path: String,
  static_prefixes: Vec<String>,
}

impl Dispatcher {
  pub fn new(origin: &Url, metadata_path: &str, static_prefixes: &[String]) -> Self {
    Self {
      origin: origin.origin(),
      metadata_path: metadata_path.to_string(),
      static_prefixes: static_prefixes.to_vec(),
    }
  }

  /// Rules are checked in order; documents must be matched before static
  /// assets so HTML is never served cache-first.
  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::GET {
      return Route::Bypass(BypassReason::NonGet);
    }
    if request.url.origin() != self.origin {
      return Route::Bypass(BypassReason::CrossOrigin);
    }
    if request.destination == Destination::Document {
      return Route::NetworkFirst;
    }

    let path = request.url.path();
    if path == self.metadata_path {
      return Route::StaleWhileRevalidate;
    }
    if request.destination.is_static_asset()
      || self
        .static_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return Route::CacheFirst;
    }

    Route::NetworkOnly
  }
}
