//! Network access behind a trait so hosts and tests can swap it out.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{Request, ResponseSnapshot};

/// Failure to obtain any response from the network.
///
/// An HTTP error status is not a `NetworkError`; it is a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Network unreachable: {0}")]
  Unreachable(String),

  #[error("Request to {url} failed: {reason}")]
  Transport { url: String, reason: String },

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

/// Performs real network fetches.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError>;
}

/// HTTP fetcher backed by reqwest.
///
/// No timeout is configured; requests inherit whatever reqwest and the OS impose.
#[derive(Clone, Default)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| transport_error(request, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| transport_error(request, e))?
      .to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}

fn transport_error(request: &Request, e: reqwest::Error) -> NetworkError {
  if e.is_builder() {
    return NetworkError::InvalidRequest(e.to_string());
  }
  if e.is_connect() {
    return NetworkError::Unreachable(format!("{}: {}", request.url, e));
  }
  NetworkError::Transport {
    url: request.url.to_string(),
    reason: e.to_string(),
  }
}
