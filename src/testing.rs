//! Test doubles for the network and storage seams.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, MemoryStorage, RequestKey};
use crate::engine::EngineConfig;
use crate::net::{Fetcher, NetworkError, Request, ResponseSnapshot};

/// Config for `https://app.test/` with the stock defaults.
pub fn engine_config(prefix: &str, version: &str) -> EngineConfig {
  EngineConfig::new(Url::parse("https://app.test/").unwrap(), prefix, version)
}

/// Fetcher answering from a fixed table. Unknown URLs get a 404.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, ResponseSnapshot>>,
  offline: AtomicBool,
  latency: Mutex<Option<Duration>>,
  calls: Mutex<Vec<String>>,
}

impl StubNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn serve(&self, url: &str, response: ResponseSnapshot) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.offline.store(!online, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Option<Duration>) {
    *self.latency.lock().unwrap() = latency;
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Fetcher for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    self.calls.lock().unwrap().push(request.url.to_string());

    let latency = *self.latency.lock().unwrap();
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable(request.url.to_string()));
    }

    let response = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
    Ok(response.unwrap_or_else(|| ResponseSnapshot::new(404, "not found")))
  }
}

/// In-memory storage with switchable write and namespace-delete failures.
#[derive(Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  fail_writes: AtomicBool,
  fail_deletes: Mutex<HashSet<String>>,
}

impl FlakyStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make entry writes and deletes fail.
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_namespace_delete(&self, name: &str, fail: bool) {
    let mut names = self.fail_deletes.lock().unwrap();
    if fail {
      names.insert(name.to_string());
    } else {
      names.remove(name);
    }
  }

  fn check_write(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("Injected write failure"));
    }
    Ok(())
  }
}

impl CacheStorage for FlakyStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    self.inner.open_namespace(name)
  }

  fn namespace_names(&self) -> Result<Vec<String>> {
    self.inner.namespace_names()
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    if self.fail_deletes.lock().unwrap().contains(name) {
      return Err(eyre!("Injected delete failure for {}", name));
    }
    self.inner.delete_namespace(name)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.inner.get(namespace, key)
  }

  fn put(&self, namespace: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()> {
    self.check_write()?;
    self.inner.put(namespace, key, entry)
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    self.check_write()?;
    self.inner.delete(namespace, key)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    self.inner.keys(namespace)
  }
}
