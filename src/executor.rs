//! Strategy executor: the read/fetch/write choreography for each caching strategy.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::freshness::{self, Freshness};
use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::diagnostics::{BackgroundTask, Diagnostics, TaskOutcome, TaskReport};
use crate::http::{Request, Response, FROM_CACHE_HEADER, STALE_HEADER};
use crate::messages::ClientEvent;
use crate::network::{fetch_with_timeout, FetchError, Network};
use crate::notify::ClientNotifier;
use crate::route::Category;
use crate::strategy::{StrategyKind, StrategyPolicy, DEFAULT_NETWORK_TIMEOUT};

/// Runs a classified request through its strategy.
pub struct StrategyExecutor<S: CacheStorage, N: Network> {
  cache: CacheLayer<S>,
  network: Arc<N>,
  notifier: ClientNotifier,
  diagnostics: Diagnostics,
  refresh_threshold: f64,
  offline_page: String,
}

impl<S: CacheStorage + 'static, N: Network> StrategyExecutor<S, N> {
  pub fn new(
    cache: CacheLayer<S>,
    network: Arc<N>,
    notifier: ClientNotifier,
    diagnostics: Diagnostics,
    refresh_threshold: f64,
    offline_page: &str,
  ) -> Self {
    Self {
      cache,
      network,
      notifier,
      diagnostics,
      refresh_threshold,
      offline_page: offline_page.to_string(),
    }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  /// Serve `request` with the strategy its policy names.
  pub async fn execute(
    &self,
    category: Category,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let store = self.cache.store_for(category);
    debug!(%category, store = %store, url = %request.url, strategy = ?policy.kind, "executing strategy");

    match policy.kind {
      StrategyKind::CacheFirst if category == Category::Images => {
        self.cache_first_image(&store, policy, request).await
      }
      StrategyKind::CacheFirst => self.cache_first(&store, policy, request).await,
      StrategyKind::NetworkFirst => self.network_first(&store, policy, request).await,
      StrategyKind::StaleWhileRevalidate => {
        self.stale_while_revalidate(&store, policy, request).await
      }
      StrategyKind::NetworkOnly => self.network_only(policy, request).await,
    }
  }

  /// Cache-first with a background refresh once an entry passes the refresh threshold.
  ///
  /// 1. Valid cache entry: return it (refreshing in the background if due)
  /// 2. Missing or expired: fetch, store on success
  /// 3. Network failure: serve the expired entry marked stale, or fail
  pub async fn cache_first(
    &self,
    store: &str,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let cached = self.cache.lookup(store, request);

    if let Some(entry) = &cached {
      match freshness::evaluate(entry, policy.max_age, self.refresh_threshold, Utc::now()) {
        Freshness::Fresh => {
          return Ok(CacheResult::from_cache(entry.clone(), entry.stored_at(), false));
        }
        Freshness::RefreshDue => {
          self.spawn_refresh(store, request, policy.max_entries);
          return Ok(CacheResult::from_cache(entry.clone(), entry.stored_at(), false));
        }
        Freshness::Expired => {}
      }
    }

    match self.fetch(request, policy.network_timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.cache.put(store, request, &response, policy.max_entries);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match cached {
        Some(entry) => Ok(serve_stale(entry)),
        None => Err(e),
      },
    }
  }

  /// Cache-first for images: no background refresh, placeholder instead of failure.
  pub async fn cache_first_image(
    &self,
    store: &str,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let cached = self.cache.lookup(store, request);

    if let Some(entry) = &cached {
      if freshness::evaluate(entry, policy.max_age, self.refresh_threshold, Utc::now()).is_valid() {
        return Ok(CacheResult::from_cache(entry.clone(), entry.stored_at(), false));
      }
    }

    match self.fetch(request, policy.network_timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.cache.put(store, request, &response, policy.max_entries);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match cached {
        Some(entry) => Ok(serve_stale(entry)),
        None => {
          debug!(url = %request.url, error = %e, "serving placeholder image");
          Ok(CacheResult::fallback(Response::placeholder_image()))
        }
      },
    }
  }

  /// Network-first with a bounded wait; any cached copy beats a failure.
  pub async fn network_first(
    &self,
    store: &str,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let timeout = policy.network_timeout.unwrap_or(DEFAULT_NETWORK_TIMEOUT);

    match self.fetch(request, Some(timeout)).await {
      Ok(response) => {
        if response.is_success() {
          self.cache.put(store, request, &response, policy.max_entries);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network-first falling back to cache");
        match self.cache.lookup(store, request) {
          Some(mut entry) => {
            let cached_at = entry.stored_at();
            entry.set_header(FROM_CACHE_HEADER, "true");
            Ok(CacheResult::offline(entry, cached_at))
          }
          None => self.offline_fallback(request, e),
        }
      }
    }
  }

  /// Serve a valid cached copy at once while a background fetch refreshes it.
  ///
  /// Without a valid copy the caller waits for that same background fetch.
  pub async fn stale_while_revalidate(
    &self,
    store: &str,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let cached = self.cache.lookup(store, request);
    let revalidation = self.spawn_revalidate(store, request, policy.max_entries);

    if let Some(entry) = &cached {
      if freshness::evaluate(entry, policy.max_age, self.refresh_threshold, Utc::now()).is_valid() {
        // The revalidation keeps running detached
        return Ok(CacheResult::from_cache(entry.clone(), entry.stored_at(), false));
      }
    }

    let error = match revalidation.await {
      Ok(Ok(response)) => return Ok(CacheResult::from_network(response)),
      Ok(Err(e)) => e,
      Err(join_error) => FetchError::network(&request.url, join_error),
    };

    match cached {
      Some(entry) => Ok(serve_stale(entry)),
      None => self.offline_fallback(request, error),
    }
  }

  /// Straight to the network; nothing is read from or written to a store.
  pub async fn network_only(
    &self,
    policy: &StrategyPolicy,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    match self.fetch(request, policy.network_timeout).await {
      Ok(response) => {
        if !request.is_get() && response.is_success() {
          self.notifier.broadcast(ClientEvent::OperationLogged {
            method: request.method.clone(),
            url: request.url.to_string(),
            status: response.status,
            timestamp: Utc::now().timestamp_millis(),
          });
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) if request.accepts_json() => {
        debug!(url = %request.url, error = %e, "network-only request failed");
        Ok(CacheResult::fallback(Response::offline_json(
          "Network unavailable. Please try again when you are back online.",
        )))
      }
      Err(e) => Err(e),
    }
  }

  /// Fetch `request` and write it to `store`. Non-2xx responses count as failures.
  pub async fn fetch_and_store(
    &self,
    store: &str,
    request: &Request,
    max_entries: usize,
  ) -> Result<u16, FetchError> {
    let response = self.fetch(request, None).await?;
    if !response.is_success() {
      return Err(FetchError::network(
        &request.url,
        format!("HTTP {}", response.status),
      ));
    }
    self.cache.put(store, request, &response, max_entries);
    Ok(response.status)
  }

  /// Prefetch a route into `store`, reporting the outcome to diagnostics.
  pub async fn prefetch(
    &self,
    store: &str,
    request: &Request,
    max_entries: usize,
  ) -> Result<u16, FetchError> {
    let result = self.fetch_and_store(store, request, max_entries).await;
    let outcome = match &result {
      Ok(_) => TaskOutcome::Updated,
      Err(e) => TaskOutcome::Failed(e.to_string()),
    };
    self.diagnostics.record(TaskReport {
      task: BackgroundTask::Prefetch {
        url: request.url.to_string(),
      },
      outcome,
    });
    result
  }

  async fn fetch(
    &self,
    request: &Request,
    timeout: Option<Duration>,
  ) -> Result<Response, FetchError> {
    match timeout {
      Some(timeout) => {
        let network = Arc::clone(&self.network);
        let owned = request.clone();
        fetch_with_timeout(request.url.as_str(), timeout, async move {
          network.fetch(&owned).await
        })
        .await
      }
      None => self.network.fetch(request).await,
    }
  }

  /// HTML callers get the cached offline page, JSON callers a 503 body.
  fn offline_fallback(
    &self,
    request: &Request,
    error: FetchError,
  ) -> Result<CacheResult<Response>, FetchError> {
    if request.accepts_html() {
      let offline = request
        .url
        .join(&self.offline_page)
        .ok()
        .map(Request::get)
        .and_then(|page| self.cache.lookup(&self.cache.core_store(), &page));
      return match offline {
        Some(page) => Ok(CacheResult::fallback(page)),
        None => Err(FetchError::Offline {
          url: request.url.to_string(),
        }),
      };
    }

    if request.accepts_json() {
      return Ok(CacheResult::fallback(Response::offline_json(
        "Network unavailable and no cached data for this request.",
      )));
    }

    Err(error)
  }

  fn spawn_refresh(&self, store: &str, request: &Request, max_entries: usize) {
    let cache = self.cache.clone();
    let network = Arc::clone(&self.network);
    let diagnostics = self.diagnostics.clone();
    let store = store.to_string();
    let request = request.clone();

    tokio::spawn(async move {
      let task = BackgroundTask::Refresh {
        store: store.clone(),
        url: request.url.to_string(),
      };
      let outcome = match network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          cache.put(&store, &request, &response, max_entries);
          TaskOutcome::Updated
        }
        Ok(response) => TaskOutcome::Skipped {
          status: response.status,
        },
        Err(e) => TaskOutcome::Failed(e.to_string()),
      };
      diagnostics.record(TaskReport { task, outcome });
    });
  }

  fn spawn_revalidate(
    &self,
    store: &str,
    request: &Request,
    max_entries: usize,
  ) -> JoinHandle<Result<Response, FetchError>> {
    let cache = self.cache.clone();
    let network = Arc::clone(&self.network);
    let notifier = self.notifier.clone();
    let diagnostics = self.diagnostics.clone();
    let store = store.to_string();
    let request = request.clone();

    tokio::spawn(async move {
      let task = BackgroundTask::Revalidate {
        store: store.clone(),
        url: request.url.to_string(),
      };
      let result = network.fetch(&request).await;
      let outcome = match &result {
        Ok(response) if response.is_success() => {
          if cache.put(&store, &request, response, max_entries) {
            notifier.broadcast(ClientEvent::CacheUpdated {
              url: request.url.to_string(),
              timestamp: Utc::now().timestamp_millis(),
            });
          }
          TaskOutcome::Updated
        }
        Ok(response) => TaskOutcome::Skipped {
          status: response.status,
        },
        Err(e) => TaskOutcome::Failed(e.to_string()),
      };
      diagnostics.record(TaskReport { task, outcome });
      result
    })
  }
}

impl<S: CacheStorage, N: Network> Clone for StrategyExecutor<S, N> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      network: Arc::clone(&self.network),
      notifier: self.notifier.clone(),
      diagnostics: self.diagnostics.clone(),
      refresh_threshold: self.refresh_threshold,
      offline_page: self.offline_page.clone(),
    }
  }
}

/// Mark an expired entry that is being served because the network failed.
fn serve_stale(mut entry: Response) -> CacheResult<Response> {
  let cached_at = entry.stored_at();
  entry.set_header(STALE_HEADER, "true");
  CacheResult::from_cache(entry, cached_at, true)
}
