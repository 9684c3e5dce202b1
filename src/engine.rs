//! The engine: lifecycle, request interception and command handling.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::executor::StrategyExecutor;
use crate::http::{Request, Response};
use crate::messages::{
  ClientEvent, ControlMessage, ControlReply, EngineEvent, EventOutcome, Notification,
  NotificationAction, PushKind, PushMessage,
};
use crate::network::{FetchError, Network};
use crate::notify::ClientNotifier;
use crate::queue::MutationQueue;
use crate::route::{Category, RouteClassifier};
use crate::strategy::{StrategyRegistry, DEFAULT_NETWORK_TIMEOUT};
use crate::sync::{SyncCoordinator, SyncReport};

/// Tag of the background sync registration that drains the mutation queue.
pub const SYNC_TAG: &str = "sync-offline-data";
/// Deferred task that retries a prefetch made while offline.
pub const PREFETCH_TASK_TAG: &str = "prefetch-routes";
/// Setting holding the version that last finished installing.
pub const INSTALLED_VERSION_SETTING: &str = "installed_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
  /// Created, install not finished
  Installing,
  /// Installed and waiting to activate
  Installed,
  Active,
  /// Replaced or retired; intercepts nothing
  Redundant,
}

#[derive(Debug, Deserialize)]
struct PrefetchPayload {
  routes: Vec<String>,
}

/// Result of a prefetch command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
  pub fetched: usize,
  pub failed: Vec<String>,
  /// Whether the failed routes were queued for the next sync pass
  pub deferred: bool,
}

/// One engine per cache generation.
pub struct Engine<S: CacheStorage, N: Network> {
  config: Config,
  origin: Url,
  classifier: RouteClassifier,
  registry: StrategyRegistry,
  cache: CacheLayer<S>,
  executor: StrategyExecutor<S, N>,
  queue: Arc<MutationQueue>,
  sync: SyncCoordinator<N>,
  notifier: ClientNotifier,
  diagnostics: Diagnostics,
  state: RwLock<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl<S: CacheStorage + 'static, N: Network> Engine<S, N> {
  pub fn new(
    config: Config,
    storage: Arc<S>,
    network: Arc<N>,
    queue: Arc<MutationQueue>,
  ) -> Result<Self> {
    Self::with_notifier(config, storage, network, queue, ClientNotifier::new())
  }

  /// Build an engine that talks to an existing set of clients.
  pub fn with_notifier(
    config: Config,
    storage: Arc<S>,
    network: Arc<N>,
    queue: Arc<MutationQueue>,
    notifier: ClientNotifier,
  ) -> Result<Self> {
    config.validate()?;
    let origin = config.origin_url()?;
    let classifier = RouteClassifier::new(&config.routes)?;
    let registry = StrategyRegistry::new(&config.strategies);
    let diagnostics = Diagnostics::new();
    let cache = CacheLayer::from_shared(storage, &config.cache_prefix, &config.version);

    let executor = StrategyExecutor::new(
      cache.clone(),
      Arc::clone(&network),
      notifier.clone(),
      diagnostics.clone(),
      config.refresh_threshold,
      &config.offline_page,
    );

    let sync_timeout = registry
      .policy(Category::NetworkOnly)
      .network_timeout
      .unwrap_or(DEFAULT_NETWORK_TIMEOUT);
    let sync = SyncCoordinator::new(
      network,
      Arc::clone(&queue),
      notifier.clone(),
      origin.clone(),
      &config.api_prefix,
      &config.telemetry_endpoint,
      sync_timeout,
    );

    Ok(Self {
      config,
      origin,
      classifier,
      registry,
      cache,
      executor,
      queue,
      sync,
      notifier,
      diagnostics,
      state: RwLock::new(LifecycleState::Installing),
      skip_waiting: AtomicBool::new(false),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<MutationQueue> {
    &self.queue
  }

  pub fn notifier(&self) -> &ClientNotifier {
    &self.notifier
  }

  pub fn diagnostics(&self) -> &Diagnostics {
    &self.diagnostics
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .read()
      .map(|state| *state)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, next: LifecycleState) -> Result<()> {
    let mut state = self.state.write().map_err(|_| eyre!("Lock poisoned"))?;
    debug!(from = ?*state, to = ?next, "lifecycle transition");
    *state = next;
    Ok(())
  }

  /// Resolve a route against the origin.
  fn resolve(&self, route: &str) -> Result<Url> {
    self
      .origin
      .join(route)
      .map_err(|e| eyre!("Invalid route {}: {}", route, e))
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Precache the core assets, then wait for activation.
  ///
  /// Asset failures never fail the install: a failed batch falls back to
  /// caching just the root page and the offline page.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing)?;
    let core = self.cache.core_store();
    self.cache.storage().open_store(&core)?;

    let requests = self
      .config
      .core_assets
      .iter()
      .map(|route| self.resolve(route).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let mut cached = 0;
    let mut failed = 0;
    for batch in requests.chunks(self.config.install_batch_size.max(1)) {
      let results = join_all(
        batch
          .iter()
          .map(|request| self.executor.fetch_and_store(&core, request, usize::MAX)),
      )
      .await;
      for (request, result) in batch.iter().zip(results) {
        match result {
          Ok(_) => cached += 1,
          Err(e) => {
            warn!(url = %request.url, error = %e, "core asset could not be precached");
            failed += 1;
          }
        }
      }
    }

    if failed > 0 {
      warn!(failed, "precache incomplete, caching minimal assets");
      for route in ["/", self.config.offline_page.as_str()] {
        let request = Request::get(self.resolve(route)?);
        if let Err(e) = self.executor.fetch_and_store(&core, &request, usize::MAX).await {
          warn!(url = %request.url, error = %e, "minimal asset could not be cached");
        }
      }
    }

    if let Err(e) = self
      .queue
      .set_setting(INSTALLED_VERSION_SETTING, &self.config.version)
    {
      warn!(error = %e, "could not record installed version");
    }

    self.set_state(LifecycleState::Installed)?;
    info!(version = %self.config.version, cached, failed, "install finished");

    if self.skip_waiting.swap(false, Ordering::SeqCst) {
      self.activate()?;
    }
    Ok(())
  }

  /// Drop every other generation, take control of open clients and prune old entries.
  pub fn activate(&self) -> Result<()> {
    let deleted = self.cache.delete_obsolete()?;
    let clients = self.notifier.claim(&self.config.version);
    let pruned = self.cache.optimize(self.optimize_max_age(), Utc::now());
    self.set_state(LifecycleState::Active)?;
    info!(
      version = %self.config.version,
      deleted = deleted.len(),
      clients,
      pruned,
      "activated"
    );
    Ok(())
  }

  /// Whether another version has claimed the clients since this one activated.
  ///
  /// A superseded engine becomes redundant the first time it notices.
  fn superseded(&self) -> bool {
    let controller = self.notifier.controller();
    if controller.as_deref() == Some(self.version()) {
      return false;
    }
    info!(
      version = %self.config.version,
      controller = ?controller,
      "superseded by another version"
    );
    if let Err(e) = self.set_state(LifecycleState::Redundant) {
      warn!(error = %e, "could not retire superseded engine");
    }
    true
  }

  /// Stop intercepting requests.
  pub fn retire(&self) -> Result<()> {
    self.set_state(LifecycleState::Redundant)?;
    info!(version = %self.config.version, "retired");
    Ok(())
  }

  fn optimize_max_age(&self) -> Duration {
    Duration::from_secs(self.config.optimize_max_age_secs)
  }

  /// Run the periodic maintenance pass.
  pub fn optimize(&self) -> usize {
    self.cache.optimize(self.optimize_max_age(), Utc::now())
  }

  // ==========================================================================
  // Requests
  // ==========================================================================

  /// Answer an intercepted request.
  ///
  /// `None` means the request is not intercepted and goes to the network untouched.
  pub async fn handle_fetch(
    &self,
    request: &Request,
  ) -> Option<Result<CacheResult<Response>, FetchError>> {
    if self.state() != LifecycleState::Active || self.superseded() {
      return None;
    }
    let category = self.classifier.classify(request)?;
    let policy = self.registry.policy(category);
    Some(self.executor.execute(category, policy, request).await)
  }

  // ==========================================================================
  // Control messages
  // ==========================================================================

  pub async fn handle_control(&self, message: ControlMessage) -> Result<ControlReply> {
    debug!(?message, "control message");
    match message {
      ControlMessage::ActivateNow => {
        if self.state() == LifecycleState::Installed {
          self.activate()?;
        } else {
          self.skip_waiting.store(true, Ordering::SeqCst);
        }
        Ok(ControlReply::success(true))
      }
      ControlMessage::GetVersion => Ok(ControlReply::Version {
        version: self.config.version.clone(),
      }),
      ControlMessage::GetCacheStats => Ok(ControlReply::CacheStats(self.cache.stats()?)),
      ControlMessage::ClearCache { cache_name } => {
        Ok(ControlReply::success(self.cache.clear(&cache_name)?))
      }
      ControlMessage::PrefetchRoutes { routes } => {
        let report = self.prefetch_routes(&routes, true).await?;
        Ok(ControlReply::success(
          report.failed.is_empty() || report.deferred,
        ))
      }
      ControlMessage::OptimizeCaches => {
        self.optimize();
        Ok(ControlReply::success(true))
      }
      ControlMessage::SyncOfflineData => {
        self.sync_offline_data().await?;
        Ok(ControlReply::success(true))
      }
    }
  }

  /// Fetch routes into the store their classification selects.
  ///
  /// With `defer_failures`, routes that could not be fetched are queued for the
  /// next sync pass.
  pub async fn prefetch_routes(
    &self,
    routes: &[String],
    defer_failures: bool,
  ) -> Result<PrefetchReport> {
    let mut report = PrefetchReport::default();

    for route in routes {
      let request = Request::get(self.resolve(route)?);
      let category = match self.classifier.classify(&request) {
        Some(category) if category.is_cacheable() => category,
        _ => {
          debug!(%route, "route is not cacheable, skipping prefetch");
          continue;
        }
      };
      let store = self.cache.store_for(category);
      let max_entries = self.registry.policy(category).max_entries;

      match self.executor.prefetch(&store, &request, max_entries).await {
        Ok(_) => report.fetched += 1,
        Err(_) => report.failed.push(route.clone()),
      }
    }

    if defer_failures && !report.failed.is_empty() {
      self.queue.defer_task(
        PREFETCH_TASK_TAG,
        serde_json::json!({ "routes": report.failed }),
      )?;
      report.deferred = true;
      info!(routes = report.failed.len(), "deferred prefetch until next sync");
    }

    Ok(report)
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  /// Replay queued mutations and run deferred tasks, then announce the pass.
  pub async fn sync_offline_data(&self) -> Result<SyncReport> {
    let report = self.sync.replay_pending().await?;
    self.run_deferred_tasks().await;
    self.sync.finish(&report);
    Ok(report)
  }

  /// Run every deferred task this engine knows. Failures are logged per task.
  async fn run_deferred_tasks(&self) {
    let tasks = match self.queue.deferred_tasks() {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(error = %e, "could not read deferred tasks");
        return;
      }
    };

    for task in tasks {
      if task.tag != PREFETCH_TASK_TAG {
        warn!(id = %task.id, tag = %task.tag, "unknown deferred task left in place");
        continue;
      }

      match serde_json::from_value::<PrefetchPayload>(task.payload.clone()) {
        Ok(payload) => match self.prefetch_routes(&payload.routes, false).await {
          Ok(report) => info!(
            fetched = report.fetched,
            failed = report.failed.len(),
            "ran deferred prefetch"
          ),
          Err(e) => warn!(id = %task.id, error = %e, "dropping deferred prefetch that cannot run"),
        },
        Err(e) => warn!(id = %task.id, error = %e, "dropping malformed deferred prefetch"),
      }
      if let Err(e) = self.queue.remove_task(&task.id) {
        warn!(id = %task.id, error = %e, "could not remove deferred task");
      }
    }
  }

  /// Record a telemetry event for the next sync pass.
  pub fn log_event(&self, level: &str, message: &str, context: serde_json::Value) -> Result<i64> {
    self.queue.log_event(level, message, context)
  }

  // ==========================================================================
  // Push
  // ==========================================================================

  pub fn handle_push(&self, push: PushMessage) -> EventOutcome {
    match push.kind {
      PushKind::Silent | PushKind::Update => {
        self.notifier.broadcast(ClientEvent::UpdatesAvailable {
          payload: push.payload,
        });
        EventOutcome::Done
      }
      PushKind::Notification => EventOutcome::ShowNotification(Notification {
        title: push.title.unwrap_or_else(|| "New notification".to_string()),
        body: push.body.unwrap_or_default(),
        url: push.url.unwrap_or_else(|| "/".to_string()),
        actions: vec![NotificationAction::View, NotificationAction::Close],
      }),
    }
  }

  pub fn handle_notification_click(
    &self,
    action: Option<NotificationAction>,
    url: String,
  ) -> EventOutcome {
    if action == Some(NotificationAction::Close) {
      return EventOutcome::Done;
    }
    if self.notifier.client_count() > 0 {
      self.notifier.broadcast(ClientEvent::Navigate { url });
      EventOutcome::Done
    } else {
      EventOutcome::OpenWindow { url }
    }
  }

  // ==========================================================================
  // Dispatch
  // ==========================================================================

  /// Handle any engine event.
  pub async fn dispatch(&self, event: EngineEvent) -> Result<EventOutcome> {
    match event {
      EngineEvent::Install => {
        self.install().await?;
        Ok(EventOutcome::Done)
      }
      EngineEvent::Activate => {
        self.activate()?;
        Ok(EventOutcome::Done)
      }
      EngineEvent::Fetch(request) => Ok(match self.handle_fetch(&request).await {
        None => EventOutcome::Response(None),
        Some(Ok(result)) => EventOutcome::Response(Some(result.data)),
        Some(Err(e)) => EventOutcome::FetchFailed(e.to_string()),
      }),
      EngineEvent::Message(message) => Ok(EventOutcome::Reply(self.handle_control(message).await?)),
      EngineEvent::Sync { tag } => {
        if tag == SYNC_TAG {
          self.sync_offline_data().await?;
        } else {
          debug!(%tag, "ignoring unknown sync registration");
        }
        Ok(EventOutcome::Done)
      }
      EngineEvent::Online => {
        self.sync_offline_data().await?;
        Ok(EventOutcome::Done)
      }
      EngineEvent::Push(push) => Ok(self.handle_push(push)),
      EngineEvent::NotificationClick { action, url } => {
        Ok(self.handle_notification_click(action, url))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::testing::MockNetwork;
  use serde_json::json;

  const ORIGIN: &str = "https://app.test";

  fn config(version: &str) -> Config {
    Config {
      origin: ORIGIN.to_string(),
      version: version.to_string(),
      cache_prefix: "app".to_string(),
      core_assets: vec!["/".to_string(), "/offline".to_string(), "/app.js".to_string()],
      ..Config::default()
    }
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse(&url(path)).unwrap())
  }

  struct Harness {
    engine: Engine<SqliteStorage, MockNetwork>,
    storage: Arc<SqliteStorage>,
    network: Arc<MockNetwork>,
  }

  impl Harness {
    fn new(version: &str) -> Self {
      Self::with_storage(version, Arc::new(SqliteStorage::open_in_memory().unwrap()))
    }

    fn with_storage(version: &str, storage: Arc<SqliteStorage>) -> Self {
      Self::sharing(version, storage, ClientNotifier::new())
    }

    /// An engine over storage and clients that another generation also uses.
    fn sharing(version: &str, storage: Arc<SqliteStorage>, notifier: ClientNotifier) -> Self {
      let network = Arc::new(MockNetwork::new());
      for path in ["/", "/offline", "/app.js"] {
        network.respond(&url(path), Response::new(200, path));
      }
      let queue = Arc::new(MutationQueue::open_in_memory().unwrap());
      let engine =
        Engine::with_notifier(config(version), storage.clone(), network.clone(), queue, notifier)
          .unwrap();
      Self {
        engine,
        storage,
        network,
      }
    }

    async fn activated(version: &str) -> Self {
      let h = Self::new(version);
      h.engine.install().await.unwrap();
      h.engine.activate().unwrap();
      h
    }
  }

  #[test]
  fn test_new_rejects_invalid_config() {
    let mut cfg = config("v1");
    cfg.refresh_threshold = 2.0;
    let result = Engine::new(
      cfg,
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(MockNetwork::new()),
      Arc::new(MutationQueue::open_in_memory().unwrap()),
    );
    assert!(result.is_err());
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  #[tokio::test]
  async fn test_install_precaches_core_assets() {
    let h = Harness::new("v1");
    h.engine.install().await.unwrap();

    assert_eq!(h.engine.state(), LifecycleState::Installed);
    let core = h.engine.cache().core_store();
    assert_eq!(h.storage.keys(&core).unwrap().len(), 3);
    let installed: Option<String> = h
      .engine
      .queue()
      .get_setting(INSTALLED_VERSION_SETTING)
      .unwrap();
    assert_eq!(installed.as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_install_falls_back_to_minimal_assets() {
    let h = Harness::new("v1");
    h.network.fail(&url("/app.js"));

    h.engine.install().await.unwrap();
    let core = h.engine.cache().core_store();
    let urls: Vec<String> = h
      .storage
      .keys(&core)
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    assert!(urls.contains(&url("/")));
    assert!(urls.contains(&url("/offline")));
    assert!(!urls.contains(&url("/app.js")));
    assert_eq!(h.engine.state(), LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_install_survives_being_offline() {
    let h = Harness::new("v1");
    h.network.set_offline(true);
    h.engine.install().await.unwrap();
    assert_eq!(h.engine.state(), LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_activation_deletes_previous_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let old = Harness::with_storage("v1", storage.clone());
    old.engine.install().await.unwrap();
    old.engine.activate().unwrap();
    old.network.respond(&url("/api/visits"), Response::new(200, "[]"));
    old
      .engine
      .handle_fetch(&request("/api/visits"))
      .await
      .unwrap()
      .unwrap();
    assert!(storage.store_names().unwrap().contains(&"app-api-v1".to_string()));

    let new = Harness::with_storage("v2", storage.clone());
    new.engine.install().await.unwrap();
    new.engine.activate().unwrap();
    old.engine.retire().unwrap();

    let names = storage.store_names().unwrap();
    assert!(names.iter().all(|name| name.ends_with("-v2")));
    assert!(names.contains(&"app-core-v2".to_string()));
    assert_eq!(old.engine.state(), LifecycleState::Redundant);
  }

  #[tokio::test]
  async fn test_superseded_engine_stops_intercepting() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let notifier = ClientNotifier::new();
    let old = Harness::sharing("v1", storage.clone(), notifier.clone());
    old.engine.install().await.unwrap();
    old.engine.activate().unwrap();
    old.network.respond(&url("/api/visits"), Response::new(200, "[]"));

    let new = Harness::sharing("v2", storage.clone(), notifier.clone());
    new.engine.install().await.unwrap();
    new.engine.activate().unwrap();

    assert!(old.engine.handle_fetch(&request("/api/visits")).await.is_none());
    assert_eq!(old.engine.state(), LifecycleState::Redundant);
    assert_eq!(old.network.calls_to(&url("/api/visits")), 0);
    let names = storage.store_names().unwrap();
    assert!(names.iter().all(|name| name.ends_with("-v2")), "{names:?}");

    new.network.respond(&url("/api/visits"), Response::new(200, "[]"));
    assert!(new.engine.handle_fetch(&request("/api/visits")).await.is_some());
  }

  #[tokio::test]
  async fn test_activation_claims_clients() {
    let h = Harness::new("v3");
    let mut client = h.engine.notifier().subscribe();
    h.engine.install().await.unwrap();
    h.engine.activate().unwrap();

    assert_eq!(h.engine.notifier().controller().as_deref(), Some("v3"));
    assert_eq!(
      client.recv().await.unwrap(),
      ClientEvent::ControllerChanged {
        version: "v3".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_activate_now_before_install_skips_waiting() {
    let h = Harness::new("v1");
    let reply = h.engine.handle_control(ControlMessage::ActivateNow).await.unwrap();
    assert_eq!(reply, ControlReply::success(true));
    assert_eq!(h.engine.state(), LifecycleState::Installing);

    h.engine.install().await.unwrap();
    assert_eq!(h.engine.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_activate_now_while_waiting() {
    let h = Harness::new("v1");
    h.engine.install().await.unwrap();
    h.engine.handle_control(ControlMessage::ActivateNow).await.unwrap();
    assert_eq!(h.engine.state(), LifecycleState::Active);
  }

  // ==========================================================================
  // Requests
  // ==========================================================================

  #[tokio::test]
  async fn test_fetch_passes_through_until_active() {
    let h = Harness::new("v1");
    assert!(h.engine.handle_fetch(&request("/app.js")).await.is_none());
    h.engine.install().await.unwrap();
    assert!(h.engine.handle_fetch(&request("/app.js")).await.is_none());

    h.engine.activate().unwrap();
    assert!(h.engine.handle_fetch(&request("/app.js")).await.is_some());

    h.engine.retire().unwrap();
    assert!(h.engine.handle_fetch(&request("/app.js")).await.is_none());
  }

  #[tokio::test]
  async fn test_fetch_ignores_extension_schemes() {
    let h = Harness::activated("v1").await;
    let req = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
    assert!(h.engine.handle_fetch(&req).await.is_none());
  }

  #[tokio::test]
  async fn test_fetch_routes_by_category() {
    let h = Harness::activated("v1").await;
    h.network
      .respond(&url("/assets/site.css"), Response::new(200, "css"));

    let first = h
      .engine
      .handle_fetch(&request("/assets/site.css"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = h
      .engine
      .handle_fetch(&request("/assets/site.css"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(h.network.calls_to(&url("/assets/site.css")), 1);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let h = Harness::activated("v1").await;
    h.network.set_offline(true);

    let result = h
      .engine
      .handle_fetch(&request("/never-visited").navigation())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.body, b"/offline");
  }

  // ==========================================================================
  // Control messages
  // ==========================================================================

  #[tokio::test]
  async fn test_get_version_and_stats() {
    let h = Harness::activated("v7").await;
    assert_eq!(
      h.engine.handle_control(ControlMessage::GetVersion).await.unwrap(),
      ControlReply::Version {
        version: "v7".to_string()
      }
    );

    match h.engine.handle_control(ControlMessage::GetCacheStats).await.unwrap() {
      ControlReply::CacheStats(stats) => assert_eq!(stats["app-core-v7"].count, 3),
      other => panic!("unexpected reply {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let h = Harness::activated("v1").await;
    let clear = |name: &str| ControlMessage::ClearCache {
      cache_name: name.to_string(),
    };

    assert_eq!(
      h.engine.handle_control(clear("app-core-v1")).await.unwrap(),
      ControlReply::success(true)
    );
    assert_eq!(
      h.engine.handle_control(clear("app-core-v1")).await.unwrap(),
      ControlReply::success(false)
    );
  }

  #[tokio::test]
  async fn test_prefetch_routes_into_page_store() {
    let h = Harness::activated("v1").await;
    h.network.respond(&url("/dashboard"), Response::new(200, "dash"));

    let reply = h
      .engine
      .handle_control(ControlMessage::PrefetchRoutes {
        routes: vec!["/dashboard".to_string()],
      })
      .await
      .unwrap();
    assert_eq!(reply, ControlReply::success(true));

    let pages = h.engine.cache().store_for(Category::Pages);
    assert!(h.engine.cache().lookup(&pages, &request("/dashboard")).is_some());
  }

  #[tokio::test]
  async fn test_offline_prefetch_runs_on_next_sync() {
    let h = Harness::activated("v1").await;
    h.network.set_offline(true);

    let report = h
      .engine
      .prefetch_routes(&["/reports".to_string()], true)
      .await
      .unwrap();
    assert!(report.deferred);
    assert_eq!(h.engine.queue().deferred_tasks().unwrap().len(), 1);

    h.network.set_offline(false);
    h.network.respond(&url("/reports"), Response::new(200, "reports"));
    h.engine.sync_offline_data().await.unwrap();

    assert!(h.engine.queue().deferred_tasks().unwrap().is_empty());
    let pages = h.engine.cache().store_for(Category::Pages);
    assert!(h.engine.cache().lookup(&pages, &request("/reports")).is_some());
  }

  #[tokio::test]
  async fn test_deferred_tasks_finish_before_sync_completes() {
    let h = Harness::activated("v1").await;
    h.engine
      .queue()
      .defer_task(PREFETCH_TASK_TAG, json!({"routes": ["/reports"]}))
      .unwrap();
    h.network.respond(&url("/reports"), Response::new(200, "reports"));
    h.network.set_delay(Duration::from_millis(50));
    let mut client = h.engine.notifier().subscribe();

    let (report, pending_at_completion) = tokio::join!(h.engine.sync_offline_data(), async {
      assert_eq!(
        client.recv().await.unwrap(),
        ClientEvent::SyncCompleted { synced_count: 0 }
      );
      h.engine.queue().deferred_tasks().unwrap().len()
    });

    report.unwrap();
    assert_eq!(pending_at_completion, 0);
    let last_sync: Option<String> = h
      .engine
      .queue()
      .get_setting(crate::sync::LAST_SYNC_SETTING)
      .unwrap();
    assert!(last_sync.is_some());
  }

  #[tokio::test]
  async fn test_failing_deferred_task_does_not_fail_sync() {
    let h = Harness::activated("v1").await;
    h.engine
      .queue()
      .defer_task(PREFETCH_TASK_TAG, json!({"routes": ["http://[::1"]}))
      .unwrap();

    let reply = h
      .engine
      .handle_control(ControlMessage::SyncOfflineData)
      .await
      .unwrap();
    assert_eq!(reply, ControlReply::success(true));
    assert!(h.engine.queue().deferred_tasks().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_logged_events_upload_on_sync() {
    let h = Harness::activated("v1").await;
    h.network.respond(&url("/api/logs"), Response::new(200, ""));
    h.engine
      .log_event("error", "save failed", json!({"table": "visits"}))
      .unwrap();

    let report = h.engine.sync_offline_data().await.unwrap();
    assert_eq!(report.telemetry_flushed, 1);
    assert!(h.engine.queue().telemetry_events().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_deferred_task_is_kept() {
    let h = Harness::activated("v1").await;
    h.engine.queue().defer_task("reindex", json!({})).unwrap();
    h.engine.sync_offline_data().await.unwrap();
    assert_eq!(h.engine.queue().deferred_tasks().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_sync_offline_data_command() {
    let h = Harness::activated("v1").await;
    h.network.respond(&url("/api/visits"), Response::new(201, "{}"));
    h.engine
      .queue()
      .enqueue(
        "form-submission",
        json!({"table": "visits", "record": {"notes": "x"}}),
      )
      .unwrap();
    let mut client = h.engine.notifier().subscribe();

    let reply = h
      .engine
      .handle_control(ControlMessage::SyncOfflineData)
      .await
      .unwrap();
    assert_eq!(reply, ControlReply::success(true));
    assert!(h.engine.queue().is_empty().unwrap());
    assert_eq!(
      client.recv().await.unwrap(),
      ClientEvent::SyncCompleted { synced_count: 1 }
    );
  }

  // ==========================================================================
  // Push & dispatch
  // ==========================================================================

  #[tokio::test]
  async fn test_silent_push_broadcasts_updates() {
    let h = Harness::new("v1");
    let mut client = h.engine.notifier().subscribe();
    let outcome = h.engine.handle_push(PushMessage {
      kind: PushKind::Silent,
      title: None,
      body: None,
      url: None,
      payload: json!({"table": "visits"}),
    });
    assert!(matches!(outcome, EventOutcome::Done));
    assert_eq!(
      client.recv().await.unwrap(),
      ClientEvent::UpdatesAvailable {
        payload: json!({"table": "visits"})
      }
    );
  }

  #[test]
  fn test_notification_push_shows_notification() {
    let h = Harness::new("v1");
    let outcome = h.engine.handle_push(PushMessage {
      kind: PushKind::Notification,
      title: Some("Visit assigned".to_string()),
      body: None,
      url: Some("/visits/9".to_string()),
      payload: serde_json::Value::Null,
    });
    match outcome {
      EventOutcome::ShowNotification(n) => {
        assert_eq!(n.title, "Visit assigned");
        assert_eq!(n.url, "/visits/9");
        assert_eq!(
          n.actions,
          vec![NotificationAction::View, NotificationAction::Close]
        );
      }
      other => panic!("unexpected outcome {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_notification_click_routing() {
    let h = Harness::new("v1");
    let outcome = h
      .engine
      .handle_notification_click(Some(NotificationAction::Close), "/x".to_string());
    assert!(matches!(outcome, EventOutcome::Done));

    let outcome = h.engine.handle_notification_click(None, "/x".to_string());
    assert!(matches!(outcome, EventOutcome::OpenWindow { url } if url == "/x"));

    let mut client = h.engine.notifier().subscribe();
    let outcome = h
      .engine
      .handle_notification_click(Some(NotificationAction::View), "/y".to_string());
    assert!(matches!(outcome, EventOutcome::Done));
    assert_eq!(
      client.recv().await.unwrap(),
      ClientEvent::Navigate {
        url: "/y".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_dispatch_fetch_failure() {
    let h = Harness::activated("v1").await;
    h.network.set_offline(true);
    let outcome = h
      .engine
      .dispatch(EngineEvent::Fetch(request("/assets/never.js")))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::FetchFailed(_)));
  }

  #[tokio::test]
  async fn test_dispatch_ignores_foreign_sync_tags() {
    let h = Harness::activated("v1").await;
    h.engine
      .queue()
      .enqueue("request-replay", json!({"method": "POST", "url": "/api/x"}))
      .unwrap();
    h.engine
      .dispatch(EngineEvent::Sync {
        tag: "something-else".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(h.engine.queue().len().unwrap(), 1);
  }
}
