//! The request-interception engine.
//!
//! A `CacheEngine` is one cache generation: it owns its lifecycle state,
//! its namespace and the background work it spawned. A `Registration`
//! decides which engine controls requests and swaps engines only when the
//! application asks for it.
//!
//! ## Lifecycle
//! 1. **Installing**: precache every manifest URL into the new namespace
//! 2. **Waiting**: installed, dormant while an older engine keeps serving
//! 3. **Activating**: on `ADOPT_NEW_VERSION`, purge older namespaces, claim clients
//! 4. **Active**: requests are classified and served by strategy

pub mod control;
pub mod dispatch;
pub mod lifecycle;
pub mod manifest;
mod strategy;
pub mod version;

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Namespace, Served};
use crate::net::{Fetcher, NetworkError, Request};

use dispatch::{Dispatcher, Route};
use version::VersionManager;

pub use control::{ControlMessage, ControlReceiver, ControlSender};
pub use lifecycle::{InstallReport, LifecycleState, Registration};
pub use manifest::{ManifestSource, StaticManifest};
pub use version::PurgeReport;

/// Settings for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Only requests to this origin are intercepted
  pub origin: Url,
  /// Namespace names start with this; purge only touches matching names
  pub prefix: String,
  /// Build identifier, monotonic per deployment
  pub version: String,
  /// Served when a page load fails and nothing better is cached
  pub fallback_document: String,
  /// Path of the metadata manifest, served stale-while-revalidate
  pub metadata_manifest: String,
  /// Paths treated as static assets regardless of declared type
  pub static_prefixes: Vec<String>,
  /// Entry bound enforced after cache-first writes
  pub max_entries: usize,
}

impl EngineConfig {
  pub fn new(origin: Url, prefix: &str, version: &str) -> Self {
    Self {
      origin,
      prefix: prefix.to_string(),
      version: version.to_string(),
      fallback_document: "/offline.html".to_string(),
      metadata_manifest: "/manifest.json".to_string(),
      static_prefixes: vec!["/assets/".to_string(), "/icons/".to_string()],
      max_entries: 100,
    }
  }

  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = max_entries;
    self
  }

  pub fn with_fallback_document(mut self, path: &str) -> Self {
    self.fallback_document = path.to_string();
    self
  }
}

/// What the engine did with a request.
#[derive(Debug, Clone)]
pub enum Interception {
  /// The engine produced the response
  Respond(Served),
  /// Declined; the host sends the request to the network untouched
  PassThrough,
}

/// One cache generation and its request handling.
pub struct CacheEngine {
  config: EngineConfig,
  versions: VersionManager,
  namespace: Namespace,
  dispatcher: Dispatcher,
  fallback_url: Url,
  fetcher: Arc<dyn Fetcher>,
  state: Mutex<LifecycleState>,
  /// Fire-and-forget work (revalidation, trimming) that must still finish
  background: Mutex<JoinSet<()>>,
}

impl CacheEngine {
  pub fn new(
    config: EngineConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let fallback_url = config.origin.join(&config.fallback_document).map_err(|e| {
      eyre!(
        "Invalid fallback document {}: {}",
        config.fallback_document,
        e
      )
    })?;
    let versions = VersionManager::new(storage, &config.prefix, &config.version);
    let dispatcher = Dispatcher::new(
      &config.origin,
      &config.metadata_manifest,
      &config.static_prefixes,
    );

    Ok(Self {
      namespace: versions.current(),
      versions,
      dispatcher,
      fallback_url,
      fetcher,
      config,
      state: Mutex::new(LifecycleState::Installing),
      background: Mutex::new(JoinSet::new()),
    })
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  /// The namespace this engine reads and writes.
  pub fn namespace(&self) -> &Namespace {
    &self.namespace
  }

  pub fn state(&self) -> LifecycleState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub(crate) fn set_state(&self, next: LifecycleState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    if *state != next {
      info!(version = %self.config.version, from = ?*state, to = ?next, "Lifecycle transition");
      *state = next;
    }
  }

  /// Classify without doing any I/O.
  pub fn route(&self, request: &Request) -> Route {
    self.dispatcher.classify(request)
  }

  /// Satisfy an intercepted request, or decline it.
  ///
  /// Only an `Active` engine intercepts. The error is the network failure
  /// of a request that had no cache tier left to fall back on; cache
  /// read/write failures never show up here.
  pub async fn handle(&self, request: &Request) -> Result<Interception, NetworkError> {
    let state = self.state();
    if state != LifecycleState::Active {
      debug!(url = %request.url, ?state, "Engine not active, passing through");
      return Ok(Interception::PassThrough);
    }

    let route = self.route(request);
    debug!(method = %request.method, url = %request.url, ?route, "Routing request");

    let served = match route {
      Route::Bypass(_) | Route::NetworkOnly => return Ok(Interception::PassThrough),
      Route::NetworkFirst => self.network_first(request).await,
      Route::StaleWhileRevalidate => self.stale_while_revalidate(request).await?,
      Route::CacheFirst => self.cache_first(request).await?,
    };

    Ok(Interception::Respond(served))
  }

  /// Run `task` in the background, tracked until `settle`.
  pub(crate) fn spawn_background<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.background.lock() {
      Ok(mut tasks) => {
        // Reap whatever already finished
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
      }
      Err(e) => warn!(error = %e, "Background task set unavailable, dropping task"),
    }
  }

  /// Wait until every background task, including ones spawned while
  /// waiting, has finished.
  pub async fn settle(&self) {
    loop {
      let mut tasks = match self.background.lock() {
        Ok(mut tasks) => std::mem::take(&mut *tasks),
        Err(_) => return,
      };
      if tasks.is_empty() {
        return;
      }
      while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
          warn!(error = %e, "Background cache task failed");
        }
      }
    }
  }
}
