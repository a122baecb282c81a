//! Normalized request identity used as the cache key.

use reqwest::Method;
use std::fmt;
use url::Url;

use crate::net::Request;

/// `"<METHOD> <absolute URL>"` with the fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.as_str(), url))
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Key for a plain GET of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Secondary key with the query string removed.
  ///
  /// Returns `None` when the request has no query, since the stripped key
  /// would equal the exact one.
  pub fn stripped(request: &Request) -> Option<Self> {
    request.url.query()?;
    let mut bare = request.url.clone();
    bare.set_query(None);
    Some(Self::new(&request.method, &bare))
  }

  /// Rebuild a key read back from storage.
  pub fn from_stored(raw: String) -> Self {
    Self(raw)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
