//! Scripted network and broken storage for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::{CacheStorage, CachedEntry, StoreStats};
use crate::http::{CacheKey, Request, Response};
use crate::network::{FetchError, Network};

/// Answers from a URL → response table and records every request it sees.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  requests: Mutex<Vec<Request>>,
  delay: Mutex<Option<Duration>>,
  offline: AtomicBool,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `url` with `response` (replacing any earlier answer).
  pub fn respond(&self, url: &str, response: Response) {
    self.failing.lock().unwrap().remove(url);
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  /// Fail requests to `url` at the transport level.
  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().insert(url.to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Delay every response.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, FetchError> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let url = request.url.as_str();
    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(url) {
      return Err(FetchError::network(url, "connection refused"));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

/// Cache storage where every operation fails, like a full or corrupted disk.
pub struct FailingStorage;

fn disk_error<T>(operation: &str, store: &str) -> Result<T> {
  Err(eyre!("Failed to {} in {}: disk I/O error", operation, store))
}

impl CacheStorage for FailingStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    disk_error("open store", store)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    disk_error("list stores", "cache")
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    disk_error("delete store", store)
  }

  fn get(&self, store: &str, _key: &CacheKey) -> Result<Option<Response>> {
    disk_error("read entry", store)
  }

  fn put(&self, store: &str, _key: &CacheKey, _response: &Response) -> Result<()> {
    disk_error("write entry", store)
  }

  fn delete(&self, store: &str, _key: &CacheKey) -> Result<bool> {
    disk_error("delete entry", store)
  }

  fn keys(&self, store: &str) -> Result<Vec<CacheKey>> {
    disk_error("list keys", store)
  }

  fn entries(&self, store: &str) -> Result<Vec<CachedEntry>> {
    disk_error("list entries", store)
  }

  fn stats(&self, store: &str) -> Result<StoreStats> {
    disk_error("measure store", store)
  }
}
