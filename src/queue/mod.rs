//! Durable on-device queue for offline mutations and auxiliary records.
//!
//! Four tables live here: offline mutations, deferred tasks, telemetry events
//! and a flat settings map. Every method is a single atomic statement or a
//! short transaction; nothing is held across calls.

mod types;

pub use types::{
  DeferredTask, MutationKind, OfflineMutation, QueueScan, TelemetryEvent, UnreadableMutation,
};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::Database;

/// SQLite-backed mutation queue.
pub struct MutationQueue {
  conn: Mutex<Connection>,
}

impl MutationQueue {
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

  // ==========================================================================
  // Offline mutations
  // ==========================================================================

  /// Record a state-changing operation for later replay.
  pub fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<OfflineMutation> {
    let mutation = OfflineMutation {
      id: Uuid::new_v4().to_string(),
      kind: kind.to_string(),
      payload,
      retry_count: 0,
      last_error: None,
      last_retry_at: None,
      created_at: Utc::now(),
    };

    let payload = serde_json::to_string(&mutation.payload)
      .map_err(|e| eyre!("Failed to serialize mutation payload: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO offline_mutations (id, kind, payload, retry_count, created_at)
         VALUES (?, ?, ?, 0, ?)",
        params![
          mutation.id,
          mutation.kind,
          payload,
          mutation.created_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    debug!(id = %mutation.id, kind, "queued offline mutation");
    Ok(mutation)
  }

  /// Every readable queued mutation, oldest first. Unreadable rows are logged and skipped.
  pub fn pending(&self) -> Result<Vec<OfflineMutation>> {
    let scan = self.scan()?;
    for row in &scan.unreadable {
      warn!(id = %row.id, error = %row.error, "skipping unreadable queued mutation");
    }
    Ok(scan.mutations)
  }

  /// Every queued mutation, oldest first, decoded row by row.
  ///
  /// A row that cannot be decoded (for instance one written by another
  /// producer with a malformed payload) is reported in `unreadable` instead of
  /// failing the whole read.
  pub fn scan(&self) -> Result<QueueScan> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, retry_count, last_error, last_retry_at, created_at
         FROM offline_mutations ORDER BY created_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, MutationRow::from_row(row))))
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read mutation id: {}", e))?;

    let mut scan = QueueScan::default();
    for (id, row) in rows {
      let decoded = row
        .map_err(|e| eyre!("Failed to read mutation: {}", e))
        .and_then(MutationRow::into_mutation);
      match decoded {
        Ok(mutation) => scan.mutations.push(mutation),
        Err(e) => scan.unreadable.push(UnreadableMutation {
          id,
          error: e.to_string(),
        }),
      }
    }
    Ok(scan)
  }

  pub fn get(&self, id: &str) -> Result<Option<OfflineMutation>> {
    let row = self
      .lock()?
      .query_row(
        "SELECT id, kind, payload, retry_count, last_error, last_retry_at, created_at
         FROM offline_mutations WHERE id = ?",
        params![id],
        MutationRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?;

    row.map(MutationRow::into_mutation).transpose()
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row("SELECT COUNT(*) FROM offline_mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count mutations: {}", e))?;
    Ok(count.max(0) as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Remove a mutation once the server accepted it, or when an operator discards it.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM offline_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Count a failed replay attempt. The payload is never touched.
  pub fn record_failure(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE offline_mutations
         SET retry_count = retry_count + 1, last_error = ?, last_retry_at = ?
         WHERE id = ?",
        params![error, at.to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to record failure for mutation {}: {}", id, e))?;
    Ok(())
  }

  /// Annotate a mutation that could not be attempted at all.
  pub fn record_error(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE offline_mutations SET last_error = ?, last_retry_at = ? WHERE id = ?",
        params![error, at.to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to record error for mutation {}: {}", id, e))?;
    Ok(())
  }

  /// Write a row as-is, bypassing serialization.
  #[cfg(test)]
  pub(crate) fn insert_raw(&self, id: &str, kind: &str, payload: &str, created_at: &str) {
    self
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO offline_mutations (id, kind, payload, retry_count, created_at)
         VALUES (?, ?, ?, 0, ?)",
        params![id, kind, payload, created_at],
      )
      .unwrap();
  }

  // ==========================================================================
  // Deferred tasks
  // ==========================================================================

  pub fn defer_task(&self, tag: &str, payload: serde_json::Value) -> Result<DeferredTask> {
    let task = DeferredTask {
      id: Uuid::new_v4().to_string(),
      tag: tag.to_string(),
      payload,
      created_at: Utc::now(),
    };
    let payload = serde_json::to_string(&task.payload)
      .map_err(|e| eyre!("Failed to serialize task payload: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO deferred_tasks (id, tag, payload, created_at) VALUES (?, ?, ?, ?)",
        params![task.id, task.tag, payload, task.created_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to defer task: {}", e))?;

    Ok(task)
  }

  pub fn deferred_tasks(&self) -> Result<Vec<DeferredTask>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, tag, payload, created_at FROM deferred_tasks ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query deferred tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read deferred task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, tag, payload, created_at)| {
        Ok(DeferredTask {
          id,
          tag,
          payload: parse_json(&payload)?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  pub fn remove_task(&self, id: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM deferred_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove deferred task {}: {}", id, e))?;
    Ok(removed > 0)
  }

  // ==========================================================================
  // Telemetry
  // ==========================================================================

  pub fn log_event(&self, level: &str, message: &str, context: serde_json::Value) -> Result<i64> {
    let conn = self.lock()?;
    let context = serde_json::to_string(&context)
      .map_err(|e| eyre!("Failed to serialize event context: {}", e))?;
    conn
      .execute(
        "INSERT INTO telemetry_events (level, message, context, created_at) VALUES (?, ?, ?, ?)",
        params![level, message, context, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to record telemetry event: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  /// Every buffered event, oldest first.
  pub fn telemetry_events(&self) -> Result<Vec<TelemetryEvent>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, level, message, context, created_at FROM telemetry_events ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to query telemetry events: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read telemetry event: {}", e))?;

    rows
      .into_iter()
      .map(|(id, level, message, context, created_at)| {
        Ok(TelemetryEvent {
          id,
          level,
          message,
          context: parse_json(&context)?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  /// Delete events up to and including `last_id`; later events survive.
  pub fn clear_telemetry(&self, last_id: i64) -> Result<usize> {
    let removed = self
      .lock()?
      .execute("DELETE FROM telemetry_events WHERE id <= ?", params![last_id])
      .map_err(|e| eyre!("Failed to clear telemetry events: {}", e))?;
    Ok(removed)
  }

  // ==========================================================================
  // Settings
  // ==========================================================================

  pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let value =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize setting {}: {}", key, e))?;
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store setting {}: {}", key, e))?;
    Ok(())
  }

  pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = self
      .lock()?
      .query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", key, e))?;

    raw
      .map(|raw| {
        serde_json::from_str(&raw).map_err(|e| eyre!("Failed to deserialize setting {}: {}", key, e))
      })
      .transpose()
  }

  pub fn delete_setting(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM settings WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete setting {}: {}", key, e))?;
    Ok(removed > 0)
  }

  pub fn settings(&self) -> Result<BTreeMap<String, serde_json::Value>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key, value FROM settings")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query settings: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read setting: {}", e))?;

    rows
      .into_iter()
      .map(|(key, value)| Ok((key, parse_json(&value)?)))
      .collect()
  }
}

/// Raw column values, decoded after the statement borrow ends.
struct MutationRow {
  id: String,
  kind: String,
  payload: String,
  retry_count: u32,
  last_error: Option<String>,
  last_retry_at: Option<String>,
  created_at: String,
}

impl MutationRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      kind: row.get(1)?,
      payload: row.get(2)?,
      retry_count: row.get(3)?,
      last_error: row.get(4)?,
      last_retry_at: row.get(5)?,
      created_at: row.get(6)?,
    })
  }

  fn into_mutation(self) -> Result<OfflineMutation> {
    Ok(OfflineMutation {
      id: self.id,
      kind: self.kind,
      payload: parse_json(&self.payload)?,
      retry_count: self.retry_count,
      last_error: self.last_error,
      last_retry_at: self.last_retry_at.as_deref().map(parse_datetime).transpose()?,
      created_at: parse_datetime(&self.created_at)?,
    })
  }
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse stored JSON: {}", e))
}

/// Parse an RFC 3339 timestamp as written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_enqueue_and_list_in_order() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let first = queue
      .enqueue("form-submission", json!({"table": "visits", "record": {"n": 1}}))
      .unwrap();
    let second = queue
      .enqueue("request-replay", json!({"method": "DELETE", "url": "/api/visits/3"}))
      .unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[1].id, second.id);
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(pending[0].last_error, None);
    assert_eq!(queue.len().unwrap(), 2);
  }

  #[test]
  fn test_failure_bookkeeping_keeps_payload() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let payload = json!({"table": "visits", "record": {"n": 1}});
    let item = queue.enqueue("form-submission", payload.clone()).unwrap();

    let at = Utc::now();
    queue.record_failure(&item.id, "HTTP 500", at).unwrap();
    queue.record_failure(&item.id, "HTTP 502", at).unwrap();

    let stored = queue.get(&item.id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.last_error.as_deref(), Some("HTTP 502"));
    assert!(stored.last_retry_at.is_some());
    assert_eq!(stored.payload, payload);
  }

  #[test]
  fn test_record_error_does_not_count_as_retry() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let item = queue.enqueue("teleport", json!({})).unwrap();
    queue.record_error(&item.id, "unknown kind", Utc::now()).unwrap();

    let stored = queue.get(&item.id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.last_error.as_deref(), Some("unknown kind"));
  }

  #[test]
  fn test_unreadable_rows_do_not_hide_the_rest() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let good = queue
      .enqueue("form-submission", json!({"table": "visits", "record": {}}))
      .unwrap();
    queue.insert_raw("bad-payload", "form-submission", "not json", "2024-01-01T00:00:00Z");
    queue.insert_raw("bad-date", "request-replay", "{}", "yesterday");

    let scan = queue.scan().unwrap();
    assert_eq!(scan.mutations.len(), 1);
    assert_eq!(scan.mutations[0].id, good.id);
    let mut bad: Vec<&str> = scan.unreadable.iter().map(|r| r.id.as_str()).collect();
    bad.sort();
    assert_eq!(bad, vec!["bad-date", "bad-payload"]);

    assert_eq!(queue.pending().unwrap().len(), 1);
    assert_eq!(queue.len().unwrap(), 3);
  }

  #[test]
  fn test_remove() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let item = queue.enqueue("request-replay", json!({"method": "POST", "url": "/a"})).unwrap();
    assert!(queue.remove(&item.id).unwrap());
    assert!(!queue.remove(&item.id).unwrap());
    assert!(queue.is_empty().unwrap());
    assert!(queue.get(&item.id).unwrap().is_none());
  }

  #[test]
  fn test_deferred_tasks() {
    let queue = MutationQueue::open_in_memory().unwrap();
    let task = queue
      .defer_task("prefetch-routes", json!({"routes": ["/dashboard"]}))
      .unwrap();

    let tasks = queue.deferred_tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].tag, "prefetch-routes");
    assert_eq!(tasks[0].payload["routes"][0], "/dashboard");

    assert!(queue.remove_task(&task.id).unwrap());
    assert!(queue.deferred_tasks().unwrap().is_empty());
  }

  #[test]
  fn test_telemetry_clear_keeps_later_events() {
    let queue = MutationQueue::open_in_memory().unwrap();
    queue.log_event("info", "opened record", json!({"id": 1})).unwrap();
    let last = queue.log_event("warn", "slow save", json!({})).unwrap();
    queue.log_event("info", "after drain", json!({})).unwrap();

    assert_eq!(queue.clear_telemetry(last).unwrap(), 2);
    let remaining = queue.telemetry_events().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message, "after drain");
  }

  #[test]
  fn test_settings_map() {
    let queue = MutationQueue::open_in_memory().unwrap();
    queue.set_setting("theme", &"dark").unwrap();
    queue.set_setting("page_size", &25).unwrap();
    queue.set_setting("theme", &"light").unwrap();

    assert_eq!(queue.get_setting::<String>("theme").unwrap().as_deref(), Some("light"));
    assert_eq!(queue.get_setting::<u32>("page_size").unwrap(), Some(25));
    assert_eq!(queue.get_setting::<u32>("missing").unwrap(), None);
    assert_eq!(queue.settings().unwrap().len(), 2);

    assert!(queue.delete_setting("theme").unwrap());
    assert_eq!(queue.get_setting::<String>("theme").unwrap(), None);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shelter.db");
    let id = {
      let queue = MutationQueue::open(&path).unwrap();
      queue.enqueue("form-submission", json!({"table": "visits"})).unwrap().id
    };

    let queue = MutationQueue::open(&path).unwrap();
    assert!(queue.get(&id).unwrap().is_some());
  }
}
