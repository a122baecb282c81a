//! Request and response types that cross the interception boundary.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use url::Url;

/// Declared resource type of an outgoing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// Top-level page load
  Document,
  Script,
  Style,
  Image,
  Font,
  /// Web app metadata manifest
  Manifest,
  /// Anything else (XHR, fetch(), workers, ...)
  #[default]
  Other,
}

impl Destination {
  /// Whether this resource type is a versioned static asset.
  pub fn is_static_asset(self) -> bool {
    matches!(self, Self::Script | Self::Style | Self::Image | Self::Font)
  }
}

/// An outgoing request as seen by the engine.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercased
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
}

impl Request {
  /// Create a GET request for the given resource type.
  pub fn get(url: Url, destination: Destination) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: BTreeMap::new(),
      body: None,
      destination,
    }
  }

  /// Replace the request method.
  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  /// Add a header, lowercasing the name.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }
}

/// Immutable snapshot of a response: status, headers and body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// 2xx responses are the only ones worth caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Body decoded as UTF-8, lossy.
  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}
