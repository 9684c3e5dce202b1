//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedEntry, StoreStats};
use crate::db::Database;
use crate::http::{CacheKey, Response};

/// Trait for cache storage backends.
///
/// Every call is atomic on its own; callers never hold a transaction across calls.
pub trait CacheStorage: Send + Sync {
  /// Create a named store if it does not exist yet.
  fn open_store(&self, store: &str) -> Result<()>;

  /// Names of every store, in creation order.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all of its entries.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, store: &str, key: &CacheKey) -> Result<Option<Response>>;

  /// Insert or overwrite an entry. An overwritten entry becomes the newest.
  fn put(&self, store: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Delete a single entry.
  fn delete(&self, store: &str, key: &CacheKey) -> Result<bool>;

  /// Keys in insertion order, oldest first.
  fn keys(&self, store: &str) -> Result<Vec<CacheKey>>;

  /// Entries in insertion order, oldest first.
  fn entries(&self, store: &str) -> Result<Vec<CachedEntry>>;

  /// Entry count and approximate size of a store.
  fn stats(&self, store: &str) -> Result<StoreStats>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache stores in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = Database::open(path)?.into_connection();
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Database::open_in_memory()?.into_connection();
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Stable fixed-length row key for a request identity.
fn entry_key(key: &CacheKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.method.as_bytes());
  hasher.update(b" ");
  hasher.update(key.url.as_bytes());
  hex::encode(hasher.finalize())
}

fn decode_headers(raw: &str) -> Result<BTreeMap<String, String>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}

impl CacheStorage for SqliteStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
        params![store, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;
    Ok(())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM cache_entries WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;
    let removed = conn
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", store, e))?;
    Ok(removed > 0)
  }

  fn get(&self, store: &str, key: &CacheKey) -> Result<Option<Response>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries WHERE store = ? AND entry_key = ?",
        params![store, entry_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key.url, e))?;

    match row {
      Some((status, headers, body)) => Ok(Some(Response {
        status,
        headers: decode_headers(&headers)?,
        body,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
        params![store, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open cache store {}: {}", store, e))?;

    // REPLACE deletes the old row, so the entry gets a fresh sequence number
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (store, entry_key, method, url, status, headers, body)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          store,
          entry_key(key),
          key.method,
          key.url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key.url, e))?;

    Ok(())
  }

  fn delete(&self, store: &str, key: &CacheKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE store = ? AND entry_key = ?",
        params![store, entry_key(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key.url, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, store: &str) -> Result<Vec<CacheKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE store = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| {
        Ok(CacheKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key of {}: {}", store, e))?;

    Ok(keys)
  }

  fn entries(&self, store: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, headers, body FROM cache_entries
         WHERE store = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<(String, String, u16, String, Vec<u8>)> = stmt
      .query_map(params![store], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", store, e))?;

    rows
      .into_iter()
      .map(|(method, url, status, headers, body)| {
        Ok(CachedEntry {
          key: CacheKey { method, url },
          response: Response {
            status,
            headers: decode_headers(&headers)?,
            body,
          },
        })
      })
      .collect()
  }

  fn stats(&self, store: &str) -> Result<StoreStats> {
    let conn = self.lock()?;
    let (count, size): (i64, i64) = conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(body) + LENGTH(headers)), 0)
         FROM cache_entries WHERE store = ?",
        params![store],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to compute stats for {}: {}", store, e))?;

    Ok(StoreStats {
      count: count.max(0) as usize,
      approx_size_bytes: size.max(0) as u64,
    })
  }
}
