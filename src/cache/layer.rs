//! Cache layer that names stores per generation and keeps them bounded.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::freshness;
use super::storage::CacheStorage;
use super::traits::StoreStats;
use crate::http::{Request, Response};
use crate::route::Category;

/// Stores that are not tied to a request category.
const CORE_STORE: &str = "core";
const RUNTIME_STORE: &str = "runtime";

/// Cache layer over a storage backend.
///
/// Writes from the request path never fail the caller: storage errors are
/// logged and the write is treated as not having happened.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  prefix: String,
  version: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: S, prefix: &str, version: &str) -> Self {
    Self::from_shared(Arc::new(storage), prefix, version)
  }

  /// Build a layer over storage that another layer (another generation) may also use.
  pub fn from_shared(storage: Arc<S>, prefix: &str, version: &str) -> Self {
    Self {
      storage,
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  fn store_name(&self, store: &str) -> String {
    format!("{}-{}-{}", self.prefix, store, self.version)
  }

  /// Store holding precached core assets and the offline page.
  pub fn core_store(&self) -> String {
    self.store_name(CORE_STORE)
  }

  /// Store for routes that have no category-specific store.
  pub fn runtime_store(&self) -> String {
    self.store_name(RUNTIME_STORE)
  }

  pub fn store_for(&self, category: Category) -> String {
    if category.is_cacheable() {
      self.store_name(category.as_str())
    } else {
      self.runtime_store()
    }
  }

  /// Every store name that belongs to the current generation.
  pub fn allow_list(&self) -> Vec<String> {
    let mut names = vec![self.core_store(), self.runtime_store()];
    names.extend(
      Category::ALL
        .iter()
        .filter(|c| c.is_cacheable())
        .map(|c| self.store_name(c.as_str())),
    );
    names
  }

  /// Look up a request. Storage errors count as a miss.
  pub fn lookup(&self, store: &str, request: &Request) -> Option<Response> {
    match self.storage.get(store, &request.cache_key()) {
      Ok(found) => found,
      Err(e) => {
        warn!(store = %store, url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Write a response tagged with `now`, then enforce the store bound.
  ///
  /// Returns whether the write landed.
  pub fn put(
    &self,
    store: &str,
    request: &Request,
    response: &Response,
    max_entries: usize,
  ) -> bool {
    let stamped = response.clone().stamped(Utc::now());
    if let Err(e) = self.storage.put(store, &request.cache_key(), &stamped) {
      warn!(store = %store, url = %request.url, error = %e, "cache write failed");
      return false;
    }
    self.maintain(store, max_entries);
    true
  }

  /// Evict the oldest entries until the store holds at most `max_entries`.
  ///
  /// Best effort: failures are logged and the number of evicted entries is returned.
  pub fn maintain(&self, store: &str, max_entries: usize) -> usize {
    let keys = match self.storage.keys(store) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(store = %store, error = %e, "cache maintenance could not list keys");
        return 0;
      }
    };

    if keys.len() <= max_entries {
      return 0;
    }

    let excess = keys.len() - max_entries;
    let mut evicted = 0;
    for key in keys.iter().take(excess) {
      match self.storage.delete(store, key) {
        Ok(true) => evicted += 1,
        Ok(false) => {}
        Err(e) => warn!(store = %store, url = %key.url, error = %e, "cache eviction failed"),
      }
    }

    debug!(store = %store, evicted, "evicted oldest cache entries");
    evicted
  }

  /// Delete every entry in every store older than `max_age` at `now`.
  ///
  /// Entries without a derivable timestamp are kept.
  pub fn optimize(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
    let stores = match self.storage.store_names() {
      Ok(stores) => stores,
      Err(e) => {
        warn!(error = %e, "optimize could not list cache stores");
        return 0;
      }
    };

    let mut removed = 0;
    for store in stores {
      let entries = match self.storage.entries(&store) {
        Ok(entries) => entries,
        Err(e) => {
          warn!(store = %store, error = %e, "optimize could not read cache store");
          continue;
        }
      };

      for entry in entries {
        let Some(stored_at) = entry.stored_at() else {
          continue;
        };
        if !freshness::is_expired(stored_at, max_age, now) {
          continue;
        }
        match self.storage.delete(&store, &entry.key) {
          Ok(true) => removed += 1,
          Ok(false) => {}
          Err(e) => warn!(store = %store, url = %entry.key.url, error = %e, "optimize delete failed"),
        }
      }
    }

    info!(removed, "cache optimize pass finished");
    removed
  }

  /// Entry count and approximate size of every store.
  pub fn stats(&self) -> Result<BTreeMap<String, StoreStats>> {
    let mut stats = BTreeMap::new();
    for store in self.storage.store_names()? {
      let store_stats = self.storage.stats(&store)?;
      stats.insert(store, store_stats);
    }
    Ok(stats)
  }

  /// Delete a named store.
  pub fn clear(&self, store: &str) -> Result<bool> {
    let removed = self.storage.delete_store(store)?;
    info!(store = %store, removed, "cleared cache store");
    Ok(removed)
  }

  /// Delete every store that is not part of the current generation.
  pub fn delete_obsolete(&self) -> Result<Vec<String>> {
    let allowed = self.allow_list();
    let mut deleted = Vec::new();
    for store in self.storage.store_names()? {
      if allowed.contains(&store) {
        continue;
      }
      self.storage.delete_store(&store)?;
      info!(store = %store, "deleted obsolete cache store");
      deleted.push(store);
    }
    Ok(deleted)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      prefix: self.prefix.clone(),
      version: self.version.clone(),
    }
  }
}
