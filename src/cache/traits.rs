//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::http::{CacheKey, Response};

/// A stored request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub key: CacheKey,
  pub response: Response,
}

impl CachedEntry {
  /// When the entry was written, if it can be determined.
  pub fn stored_at(&self) -> Option<DateTime<Utc>> {
    self.response.stored_at()
  }
}

/// Size report for one named store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
  pub count: usize,
  #[serde(rename = "approxSizeBytes")]
  pub approx_size_bytes: u64,
}

/// What a strategy served, and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Stored-at time of a cached response
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from a store; `is_stale` marks an expired entry used because the network failed.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Network failed and the cached copy was served regardless of age.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// A canned response: offline page, placeholder image or 503 body.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Origin of a served response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  /// Within max age
  CacheFresh,
  /// Past max age, network failed
  CacheStale,
  Offline,
  /// Neither network nor store could answer
  Fallback,
}
