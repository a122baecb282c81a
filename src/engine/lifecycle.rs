//! Install → wait → activate transitions and the registration that decides
//! which engine controls requests.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::control::{ControlMessage, ControlReceiver};
use super::manifest::{ManifestSource, StaticManifest};
use super::version::PurgeReport;
use super::{CacheEngine, Interception};
use crate::cache::{RequestKey, Served};
use crate::net::{Destination, Fetcher, NetworkError, Request};

/// Where an engine instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed, waiting for the adoption signal
  Waiting,
  Activating,
  Active,
  /// Install aborted, replaced while waiting, or superseded
  Redundant,
}

/// Outcome of a precache pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  /// Number of manifest URLs stored
  pub stored: usize,
  /// URLs that could not be fetched or stored
  pub failed: Vec<String>,
}

impl CacheEngine {
  /// Precache every manifest URL into this engine's namespace.
  ///
  /// Fetches run in parallel and each is stored on its own; a single
  /// failure is logged and skipped. Only a manifest that does not list the
  /// fallback document, or a namespace that cannot be opened, aborts.
  pub async fn install(&self, manifest: &StaticManifest) -> Result<InstallReport> {
    let origin = &self.config.origin;
    if !manifest.contains(origin, &self.fallback_url) {
      return Err(eyre!(
        "Precache manifest does not list the fallback document {}",
        self.fallback_url
      ));
    }

    let namespace = self.versions.open_current()?;
    let urls = manifest.resolve(origin);
    info!(
      version = %self.config.version,
      namespace = namespace.name(),
      count = urls.len(),
      "Precaching manifest"
    );

    let fetches = urls.into_iter().map(|url| {
      let namespace = namespace.clone();
      async move {
        let request = Request::get(url, Destination::Other);
        let outcome = match self.fetcher.fetch(&request).await {
          Ok(response) if response.is_success() => {
            namespace.store(&RequestKey::for_request(&request), &response)
          }
          Ok(response) => Err(eyre!("Unexpected status {}", response.status)),
          Err(e) => Err(e.into()),
        };
        (request.url, outcome)
      }
    });

    let mut report = InstallReport::default();
    for (url, outcome) in join_all(fetches).await {
      match outcome {
        Ok(()) => report.stored += 1,
        Err(e) => {
          warn!(%url, error = %e, "Failed to precache resource");
          report.failed.push(url.to_string());
        }
      }
    }

    Ok(report)
  }

  /// Purge older namespaces, sparing those in `keep`. Failures are logged;
  /// activation goes on.
  pub fn activate(&self, keep: &[String]) -> PurgeReport {
    self.set_state(LifecycleState::Activating);
    match self.versions.purge_except(keep) {
      Ok(report) => report,
      Err(e) => {
        warn!(version = %self.config.version, error = %e, "Purge failed during activation");
        PurgeReport::default()
      }
    }
  }
}

/// Holds the controlling engine and at most one waiting successor.
pub struct Registration {
  fetcher: Arc<dyn Fetcher>,
  controller: RwLock<Option<Arc<CacheEngine>>>,
  waiting: Mutex<Option<Arc<CacheEngine>>>,
  /// Namespaces of installs still in progress
  installing: Mutex<Vec<String>>,
}

impl Registration {
  /// `fetcher` serves requests the controller declines.
  pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      fetcher,
      controller: RwLock::new(None),
      waiting: Mutex::new(None),
      installing: Mutex::new(Vec::new()),
    }
  }

  /// The engine currently serving requests.
  pub fn controller(&self) -> Option<Arc<CacheEngine>> {
    match self.controller.read() {
      Ok(controller) => controller.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  /// The installed engine waiting for adoption.
  pub fn waiting(&self) -> Option<Arc<CacheEngine>> {
    match self.waiting.lock() {
      Ok(waiting) => waiting.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  /// Install `engine` from `source`.
  ///
  /// Without a controller the engine activates right away. Otherwise it is
  /// parked as the waiting engine (replacing any earlier one) until the
  /// application sends `ADOPT_NEW_VERSION`. On error the engine becomes
  /// redundant and the controller is untouched.
  pub async fn register(
    &self,
    engine: CacheEngine,
    source: &ManifestSource,
  ) -> Result<(Arc<CacheEngine>, InstallReport)> {
    let engine = Arc::new(engine);
    engine.set_state(LifecycleState::Installing);
    self.track_install(engine.namespace().name(), true);

    let installed = match source.load() {
      Ok(manifest) => engine.install(&manifest).await,
      Err(e) => Err(e),
    };
    let report = match installed {
      Ok(report) => report,
      Err(e) => {
        self.track_install(engine.namespace().name(), false);
        engine.set_state(LifecycleState::Redundant);
        return Err(e.wrap_err(format!("Install of version {} aborted", engine.version())));
      }
    };
    info!(
      version = engine.version(),
      stored = report.stored,
      failed = report.failed.len(),
      "Install complete"
    );

    engine.set_state(LifecycleState::Waiting);
    {
      let mut controller = self.controller_slot();
      self.track_install(engine.namespace().name(), false);
      if controller.is_none() {
        self.claim(&mut controller, Arc::clone(&engine));
      } else if let Some(previous) = self.replace_waiting(Some(Arc::clone(&engine))) {
        previous.set_state(LifecycleState::Redundant);
      }
    }

    Ok((engine, report))
  }

  /// Take control with an engine whose namespace is already populated,
  /// e.g. after a restart. Refused when something already controls.
  pub fn resume(&self, engine: CacheEngine) -> Result<Arc<CacheEngine>> {
    let mut controller = self.controller_slot();
    if controller.is_some() {
      return Err(eyre!(
        "Cannot resume version {}: another version is active",
        engine.version()
      ));
    }
    engine.versions.open_current()?;
    let engine = Arc::new(engine);
    engine.set_state(LifecycleState::Waiting);
    self.claim(&mut controller, Arc::clone(&engine));
    Ok(engine)
  }

  /// Activate the waiting engine, if there is one.
  pub fn adopt_waiting(&self) -> Option<(Arc<CacheEngine>, PurgeReport)> {
    let mut controller = self.controller_slot();
    let engine = self.replace_waiting(None)?;
    let report = self.claim(&mut controller, Arc::clone(&engine));
    Some((engine, report))
  }

  /// Handle one control-channel command.
  pub fn post_message(&self, message: ControlMessage) -> Option<Arc<CacheEngine>> {
    match message {
      ControlMessage::AdoptNewVersion => match self.adopt_waiting() {
        Some((engine, _)) => Some(engine),
        None => {
          debug!("Adoption requested with no waiting version");
          None
        }
      },
    }
  }

  /// Process control messages until every sender is dropped.
  pub async fn serve_control(&self, mut rx: ControlReceiver) {
    while let Some(message) = rx.recv().await {
      debug!(?message, "Control message received");
      self.post_message(message);
    }
  }

  /// Route a request through the controller; anything it declines goes
  /// straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<Served, NetworkError> {
    if let Some(engine) = self.controller() {
      if let Interception::Respond(served) = engine.handle(request).await? {
        return Ok(served);
      }
    }
    self.fetcher.fetch(request).await.map(Served::from_network)
  }

  /// Drop every engine after its background work settles. Namespaces stay
  /// on disk until a later activation purges them.
  pub async fn unregister(&self) {
    let controller = self.controller_slot().take();
    let waiting = self.replace_waiting(None);

    for engine in controller.into_iter().chain(waiting) {
      engine.settle().await;
      engine.set_state(LifecycleState::Redundant);
    }
  }

  /// Write access to the controller slot. Lock order is controller, then
  /// waiting, then installing.
  fn controller_slot(&self) -> RwLockWriteGuard<'_, Option<Arc<CacheEngine>>> {
    match self.controller.write() {
      Ok(controller) => controller,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Retire the current controller, purge, then claim: from here on every
  /// request goes through `engine`.
  ///
  /// The outgoing engine stops intercepting before the purge. Its in-flight
  /// work can no longer write anywhere, since writes into a deleted
  /// namespace fail. Namespaces of the waiting engine and of installs in
  /// progress survive the purge.
  fn claim(
    &self,
    controller: &mut Option<Arc<CacheEngine>>,
    engine: Arc<CacheEngine>,
  ) -> PurgeReport {
    if let Some(previous) = controller.take() {
      previous.set_state(LifecycleState::Redundant);
    }

    let mut keep = self.installing_names();
    if let Some(waiting) = self.waiting() {
      keep.push(waiting.namespace().name().to_string());
    }
    let report = engine.activate(&keep);
    engine.set_state(LifecycleState::Active);
    *controller = Some(Arc::clone(&engine));

    info!(
      version = engine.version(),
      purged = report.deleted.len(),
      purge_failures = report.failed.len(),
      "Version activated"
    );
    report
  }

  fn installing_names(&self) -> Vec<String> {
    match self.installing.lock() {
      Ok(names) => names.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  fn track_install(&self, name: &str, started: bool) {
    let mut names = match self.installing.lock() {
      Ok(names) => names,
      Err(poisoned) => poisoned.into_inner(),
    };
    if started {
      names.push(name.to_string());
    } else if let Some(index) = names.iter().position(|n| n == name) {
      names.remove(index);
    }
  }

  fn replace_waiting(&self, next: Option<Arc<CacheEngine>>) -> Option<Arc<CacheEngine>> {
    let mut waiting = match self.waiting.lock() {
      Ok(waiting) => waiting,
      Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::replace(&mut *waiting, next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStorage, MemoryStorage};
  use crate::engine::control;
  use crate::net::ResponseSnapshot;
  use crate::testing::{engine_config, FlakyStorage, StubNetwork};
  use url::Url;

  fn shell_network() -> Arc<StubNetwork> {
    let network = StubNetwork::new();
    network.serve("https://app.test/shell.html", ResponseSnapshot::new(200, "<shell>"));
    network.serve("https://app.test/app.js", ResponseSnapshot::new(200, "js"));
    network.serve("https://app.test/offline.html", ResponseSnapshot::new(200, "<offline>"));
    network
  }

  fn shell_manifest() -> ManifestSource {
    StaticManifest::new(["/shell.html", "/app.js", "/offline.html"]).into()
  }

  fn document(path: &str) -> Request {
    Request::get(
      Url::parse("https://app.test/").unwrap().join(path).unwrap(),
      Destination::Document,
    )
  }

  #[tokio::test]
  async fn test_offline_shell_scenario() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());
    storage.open_namespace("v-old").unwrap();

    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(engine_config("v-", "new"), storage.clone(), network.clone()).unwrap();
    let (engine, report) = registration.register(engine, &shell_manifest()).await.unwrap();

    assert_eq!(report.stored, 3);
    assert!(report.failed.is_empty());
    assert_eq!(engine.state(), LifecycleState::Active);
    assert_eq!(storage.namespace_names().unwrap(), vec!["v-new".to_string()]);

    network.set_online(false);
    let served = registration.fetch(&document("/games/7")).await.unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.body, b"<offline>");
  }

  #[tokio::test]
  async fn test_partial_precache_failure_does_not_abort() {
    let network = shell_network();
    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(
      engine_config("v-", "1"),
      Arc::new(MemoryStorage::new()),
      network.clone(),
    )
    .unwrap();

    let manifest = StaticManifest::new(["/shell.html", "/gone.css", "/offline.html"]).into();
    let (engine, report) = registration.register(engine, &manifest).await.unwrap();

    assert_eq!(report.stored, 2);
    assert_eq!(report.failed, vec!["https://app.test/gone.css".to_string()]);
    assert_eq!(engine.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_unreadable_manifest_aborts_install() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());

    let first = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    let (first, _) = registration.register(first, &shell_manifest()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let second = CacheEngine::new(engine_config("v-", "2"), storage.clone(), network.clone()).unwrap();
    let result = registration
      .register(second, &ManifestSource::Path(dir.path().join("missing.json")))
      .await;

    assert!(result.is_err());
    assert!(registration.waiting().is_none());
    let controller = registration.controller().unwrap();
    assert!(Arc::ptr_eq(&controller, &first));
    assert_eq!(first.state(), LifecycleState::Active);
    assert_eq!(storage.namespace_names().unwrap(), vec!["v-1".to_string()]);
  }

  #[tokio::test]
  async fn test_manifest_without_fallback_aborts_install() {
    let network = shell_network();
    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(
      engine_config("v-", "1"),
      Arc::new(MemoryStorage::new()),
      network.clone(),
    )
    .unwrap();

    let manifest = StaticManifest::new(["/shell.html"]).into();
    assert!(registration.register(engine, &manifest).await.is_err());
    assert!(registration.controller().is_none());
  }

  #[tokio::test]
  async fn test_update_waits_for_adoption() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());

    let v1 = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    let (v1, _) = registration.register(v1, &shell_manifest()).await.unwrap();

    network.serve("https://app.test/app.js", ResponseSnapshot::new(200, "js v2"));
    let v2 = CacheEngine::new(engine_config("v-", "2"), storage.clone(), network.clone()).unwrap();
    let (v2, _) = registration.register(v2, &shell_manifest()).await.unwrap();

    // Installed but dormant: v1 keeps serving and its namespace survives
    assert_eq!(v2.state(), LifecycleState::Waiting);
    assert!(Arc::ptr_eq(&registration.controller().unwrap(), &v1));
    assert_eq!(
      storage.namespace_names().unwrap(),
      vec!["v-1".to_string(), "v-2".to_string()]
    );
    let script = Request::get(Url::parse("https://app.test/app.js").unwrap(), Destination::Script);
    assert_eq!(registration.fetch(&script).await.unwrap().response.body, b"js");

    let (adopted, report) = registration.adopt_waiting().unwrap();
    assert!(Arc::ptr_eq(&adopted, &v2));
    assert_eq!(report.deleted, vec!["v-1".to_string()]);
    assert_eq!(v1.state(), LifecycleState::Redundant);
    assert_eq!(v2.state(), LifecycleState::Active);
    assert_eq!(storage.namespace_names().unwrap(), vec!["v-2".to_string()]);
    assert_eq!(registration.fetch(&script).await.unwrap().response.body, b"js v2");
  }

  #[tokio::test]
  async fn test_newer_install_replaces_waiting() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());

    for version in ["1", "2", "3"] {
      let engine = CacheEngine::new(engine_config("v-", version), storage.clone(), network.clone()).unwrap();
      registration.register(engine, &shell_manifest()).await.unwrap();
    }

    let waiting = registration.waiting().unwrap();
    assert_eq!(waiting.version(), "3");
    assert_eq!(registration.controller().unwrap().version(), "1");
  }

  #[tokio::test]
  async fn test_adoption_through_control_channel() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());

    let v1 = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    registration.register(v1, &shell_manifest()).await.unwrap();
    let v2 = CacheEngine::new(engine_config("v-", "2"), storage.clone(), network.clone()).unwrap();
    registration.register(v2, &shell_manifest()).await.unwrap();

    let (tx, rx) = control::channel();
    tx.post(&ControlMessage::AdoptNewVersion.to_json()).unwrap();
    drop(tx);
    registration.serve_control(rx).await;

    assert_eq!(registration.controller().unwrap().version(), "2");
    assert!(registration.waiting().is_none());
  }

  #[tokio::test]
  async fn test_adopt_without_waiting_is_noop() {
    let registration = Registration::new(StubNetwork::new());
    assert!(registration.post_message(ControlMessage::AdoptNewVersion).is_none());
    assert!(registration.controller().is_none());
  }

  #[tokio::test]
  async fn test_purge_failure_does_not_block_activation() {
    let network = shell_network();
    let storage = Arc::new(FlakyStorage::new());
    storage.open_namespace("v-old").unwrap();
    storage.fail_namespace_delete("v-old", true);

    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(engine_config("v-", "new"), storage.clone(), network.clone()).unwrap();
    let (engine, _) = registration.register(engine, &shell_manifest()).await.unwrap();

    assert_eq!(engine.state(), LifecycleState::Active);
    assert_eq!(
      storage.namespace_names().unwrap(),
      vec!["v-new".to_string(), "v-old".to_string()]
    );
  }

  #[tokio::test]
  async fn test_resume_serves_persisted_namespace() {
    let network = shell_network();
    let storage = Arc::new(MemoryStorage::new());

    let first = Registration::new(network.clone());
    let engine = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    first.register(engine, &shell_manifest()).await.unwrap();
    first.unregister().await;
    assert!(first.controller().is_none());

    network.set_online(false);
    let second = Registration::new(network.clone());
    let engine = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    second.resume(engine).unwrap();

    let served = second.fetch(&document("/shell.html")).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"<shell>");

    let again = CacheEngine::new(engine_config("v-", "1"), storage, network.clone()).unwrap();
    assert!(second.resume(again).is_err());
  }

  #[tokio::test]
  async fn test_retired_engine_cannot_recreate_purged_namespace() {
    let network = shell_network();
    network.serve("https://app.test/manifest.json", ResponseSnapshot::new(200, "{}"));
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());
    let manifest: ManifestSource =
      StaticManifest::new(["/shell.html", "/manifest.json", "/offline.html"]).into();

    let v1 = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    let (v1, _) = registration.register(v1, &manifest).await.unwrap();
    let v2 = CacheEngine::new(engine_config("v-", "2"), storage.clone(), network.clone()).unwrap();
    registration.register(v2, &manifest).await.unwrap();

    // Cached hit on v1 leaves a slow refresh running in the background
    network.set_latency(Some(std::time::Duration::from_millis(50)));
    let metadata = Request::get(
      Url::parse("https://app.test/manifest.json").unwrap(),
      Destination::Manifest,
    );
    let served = registration.fetch(&metadata).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);

    registration.adopt_waiting().unwrap();
    assert_eq!(storage.namespace_names().unwrap(), vec!["v-2".to_string()]);

    v1.settle().await;
    assert_eq!(v1.state(), LifecycleState::Redundant);
    assert_eq!(storage.namespace_names().unwrap(), vec!["v-2".to_string()]);
    assert!(matches!(v1.handle(&metadata).await.unwrap(), Interception::PassThrough));
  }

  #[tokio::test]
  async fn test_concurrent_first_installs_activate_once() {
    let network = shell_network();
    network.set_latency(Some(std::time::Duration::from_millis(10)));
    let storage = Arc::new(MemoryStorage::new());
    let registration = Registration::new(network.clone());

    let v1 = CacheEngine::new(engine_config("v-", "1"), storage.clone(), network.clone()).unwrap();
    let v2 = CacheEngine::new(engine_config("v-", "2"), storage.clone(), network.clone()).unwrap();
    let manifest = shell_manifest();
    let (a, b) = futures::join!(
      registration.register(v1, &manifest),
      registration.register(v2, &manifest)
    );
    a.unwrap();
    b.unwrap();

    let controller = registration.controller().unwrap();
    let waiting = registration.waiting().unwrap();
    assert_ne!(controller.version(), waiting.version());
    assert_eq!(controller.state(), LifecycleState::Active);
    assert_eq!(waiting.state(), LifecycleState::Waiting);
    assert_eq!(
      storage.namespace_names().unwrap(),
      vec!["v-1".to_string(), "v-2".to_string()]
    );
  }

  #[tokio::test]
  async fn test_versioned_and_bare_manifest_entries_both_serve_offline() {
    let network = shell_network();
    network.serve("https://app.test/app.js?v=7", ResponseSnapshot::new(200, "js v7"));
    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(
      engine_config("v-", "1"),
      Arc::new(MemoryStorage::new()),
      network.clone(),
    )
    .unwrap();

    let manifest = StaticManifest::new(["/app.js?v=7", "/app.js", "/offline.html"]).into();
    let (engine, report) = registration.register(engine, &manifest).await.unwrap();
    assert_eq!(report.stored, 3);

    let versioned = Request::get(Url::parse("https://app.test/app.js?v=7").unwrap(), Destination::Script);
    let bare = Request::get(Url::parse("https://app.test/app.js").unwrap(), Destination::Script);
    let keys = engine.namespace().keys().unwrap();
    assert!(keys.contains(&RequestKey::for_request(&versioned)));
    assert!(keys.contains(&RequestKey::for_request(&bare)));

    network.set_online(false);
    let served = registration.fetch(&versioned).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"js v7");
    let served = registration.fetch(&bare).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"js");
  }

  #[tokio::test]
  async fn test_post_goes_to_network_uncached() {
    let network = shell_network();
    let registration = Registration::new(network.clone());
    let engine = CacheEngine::new(
      engine_config("v-", "1"),
      Arc::new(MemoryStorage::new()),
      network.clone(),
    )
    .unwrap();
    let (engine, _) = registration.register(engine, &shell_manifest()).await.unwrap();
    let cached = engine.namespace().len().unwrap();

    let post = Request::get(Url::parse("https://app.test/app.js").unwrap(), Destination::Other)
      .with_method(reqwest::Method::POST)
      .with_header("Content-Type", "application/json")
      .with_body(b"{}".to_vec());
    let served = registration.fetch(&post).await.unwrap();

    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(engine.namespace().len().unwrap(), cached);
  }

  #[tokio::test]
  async fn test_without_controller_requests_go_to_network() {
    let network = shell_network();
    let registration = Registration::new(network.clone());
    let served = registration.fetch(&document("/shell.html")).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(network.calls_to("https://app.test/shell.html"), 1);
  }
}
