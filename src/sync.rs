//! Replays queued offline mutations against the origin.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use color_eyre::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::http::{Body, Part, Request};
use crate::messages::ClientEvent;
use crate::network::{fetch_with_timeout, FetchError, Network};
use crate::notify::ClientNotifier;
use crate::queue::{MutationKind, MutationQueue, OfflineMutation};

/// Setting that records when the last full pass finished.
pub const LAST_SYNC_SETTING: &str = "last_sync_at";

/// Why a single mutation could not be synced.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("unknown mutation type '{0}'")]
  UnknownMutationType(String),

  #[error("invalid {kind} payload: {message}")]
  InvalidPayload { kind: MutationKind, message: String },

  #[error("server rejected replay with HTTP {status}")]
  Rejected { status: u16 },

  #[error(transparent)]
  Network(#[from] FetchError),
}

impl SyncError {
  /// Whether another pass could succeed without anyone changing the item.
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Rejected { .. } | SyncError::Network(_))
  }
}

/// Outcome of one coordinator pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
  /// Ids of items that can never be replayed by this engine
  pub unsyncable: Vec<String>,
  pub telemetry_flushed: usize,
}

/// Captured HTTP request.
#[derive(Debug, Deserialize)]
struct ReplayPayload {
  method: String,
  url: String,
  #[serde(default)]
  headers: BTreeMap<String, String>,
  #[serde(default)]
  body: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FormPayload {
  table: String,
  record: serde_json::Value,
  #[serde(default)]
  method: Option<String>,
  #[serde(default)]
  id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
  table: String,
  record_id: serde_json::Value,
  file_name: String,
  content_type: String,
  /// Base64-encoded file contents
  data: String,
}

/// Drains the mutation queue, one item at a time.
pub struct SyncCoordinator<N: Network> {
  network: Arc<N>,
  queue: Arc<MutationQueue>,
  notifier: ClientNotifier,
  origin: Url,
  api_prefix: String,
  telemetry_endpoint: String,
  timeout: Duration,
}

impl<N: Network> SyncCoordinator<N> {
  pub fn new(
    network: Arc<N>,
    queue: Arc<MutationQueue>,
    notifier: ClientNotifier,
    origin: Url,
    api_prefix: &str,
    telemetry_endpoint: &str,
    timeout: Duration,
  ) -> Self {
    Self {
      network,
      queue,
      notifier,
      origin,
      api_prefix: api_prefix.trim_end_matches('/').to_string(),
      telemetry_endpoint: telemetry_endpoint.to_string(),
      timeout,
    }
  }

  /// Run one full pass: replay every pending mutation, flush telemetry,
  /// and tell open clients how many items were synced.
  pub async fn sync(&self) -> Result<SyncReport> {
    let report = self.replay_pending().await?;
    self.finish(&report);
    Ok(report)
  }

  /// Replay every pending mutation and flush telemetry.
  ///
  /// A failure on one item never aborts the batch. Items that can never
  /// succeed as stored are annotated without counting a retry.
  pub async fn replay_pending(&self) -> Result<SyncReport> {
    let scan = self.queue.scan()?;
    let mut report = SyncReport::default();

    for row in &scan.unreadable {
      warn!(id = %row.id, error = %row.error, "queued mutation cannot be read");
      if let Err(e) = self.queue.record_error(&row.id, &row.error, Utc::now()) {
        warn!(id = %row.id, error = %e, "could not record sync failure");
      }
      report.unsyncable.push(row.id.clone());
    }

    for mutation in &scan.mutations {
      match self.replay(mutation).await {
        Ok(()) => {
          if let Err(e) = self.queue.remove(&mutation.id) {
            warn!(id = %mutation.id, error = %e, "synced mutation could not be removed");
          }
          report.synced += 1;
        }
        Err(e) if e.is_retryable() => {
          warn!(id = %mutation.id, kind = %mutation.kind, error = %e, "mutation replay failed");
          self.annotate(mutation, &e, true);
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = %mutation.id, kind = %mutation.kind, error = %e, "mutation cannot be replayed");
          self.annotate(mutation, &e, false);
          report.unsyncable.push(mutation.id.clone());
        }
      }
    }

    report.telemetry_flushed = self.flush_telemetry().await;
    Ok(report)
  }

  /// Record the pass time and announce the result to open clients.
  pub fn finish(&self, report: &SyncReport) {
    if let Err(e) = self.queue.set_setting(LAST_SYNC_SETTING, &Utc::now().to_rfc3339()) {
      warn!(error = %e, "could not record sync time");
    }

    info!(
      synced = report.synced,
      failed = report.failed,
      unsyncable = report.unsyncable.len(),
      "sync pass finished"
    );
    self.notifier.broadcast(ClientEvent::SyncCompleted {
      synced_count: report.synced,
    });
  }

  fn annotate(&self, mutation: &OfflineMutation, error: &SyncError, count_retry: bool) {
    let message = error.to_string();
    let result = if count_retry {
      self.queue.record_failure(&mutation.id, &message, Utc::now())
    } else {
      self.queue.record_error(&mutation.id, &message, Utc::now())
    };
    if let Err(e) = result {
      warn!(id = %mutation.id, error = %e, "could not record sync failure");
    }
  }

  /// Replay a single mutation. Success means the server answered 2xx.
  pub async fn replay(&self, mutation: &OfflineMutation) -> Result<(), SyncError> {
    let kind = MutationKind::parse(&mutation.kind)
      .ok_or_else(|| SyncError::UnknownMutationType(mutation.kind.clone()))?;

    let request = match kind {
      MutationKind::RequestReplay => self.replay_request(&mutation.payload)?,
      MutationKind::FormSubmission => self.form_submission(&mutation.payload)?,
      MutationKind::AttachmentUpload => self.attachment_upload(&mutation.payload)?,
    };

    let response = self.send(request).await?;
    if !response.is_success() {
      return Err(SyncError::Rejected {
        status: response.status,
      });
    }
    Ok(())
  }

  async fn send(&self, request: Request) -> Result<crate::http::Response, FetchError> {
    let network = Arc::clone(&self.network);
    let url = request.url.to_string();
    fetch_with_timeout(&url, self.timeout, async move {
      network.fetch(&request).await
    })
    .await
  }

  fn resolve(&self, kind: MutationKind, target: &str) -> Result<Url, SyncError> {
    self.origin.join(target).map_err(|e| SyncError::InvalidPayload {
      kind,
      message: format!("bad url '{}': {}", target, e),
    })
  }

  fn replay_request(&self, payload: &serde_json::Value) -> Result<Request, SyncError> {
    let kind = MutationKind::RequestReplay;
    let payload: ReplayPayload = parse_payload(kind, payload)?;

    let mut request = Request::new(&payload.method, self.resolve(kind, &payload.url)?);
    for (name, value) in &payload.headers {
      request = request.with_header(name, value.clone());
    }

    match payload.body {
      None | Some(serde_json::Value::Null) => {}
      Some(serde_json::Value::String(text)) => {
        request = request.with_body(Body::Bytes(text.into_bytes()));
      }
      Some(json) => {
        if request.header("content-type").is_none() {
          request = request.with_header("content-type", "application/json");
        }
        request = request.with_body(Body::Bytes(json.to_string().into_bytes()));
      }
    }

    Ok(request)
  }

  fn form_submission(&self, payload: &serde_json::Value) -> Result<Request, SyncError> {
    let kind = MutationKind::FormSubmission;
    let payload: FormPayload = parse_payload(kind, payload)?;

    let method = payload.method.as_deref().unwrap_or("POST").to_ascii_uppercase();
    let path = match (&method[..], &payload.id) {
      ("PUT" | "PATCH" | "DELETE", Some(id)) => {
        format!("{}/{}/{}", self.api_prefix, payload.table, id_to_string(id))
      }
      _ => format!("{}/{}", self.api_prefix, payload.table),
    };

    Ok(
      Request::new(&method, self.resolve(kind, &path)?)
        .with_header("content-type", "application/json")
        .with_body(Body::Bytes(payload.record.to_string().into_bytes())),
    )
  }

  fn attachment_upload(&self, payload: &serde_json::Value) -> Result<Request, SyncError> {
    let kind = MutationKind::AttachmentUpload;
    let payload: AttachmentPayload = parse_payload(kind, payload)?;

    let data = STANDARD
      .decode(payload.data.as_bytes())
      .map_err(|e| SyncError::InvalidPayload {
        kind,
        message: format!("attachment data is not base64: {}", e),
      })?;

    let parts = vec![
      Part::text("table", payload.table),
      Part::text("record_id", id_to_string(&payload.record_id)),
      Part {
        name: "file".to_string(),
        file_name: Some(payload.file_name),
        content_type: Some(payload.content_type),
        data,
      },
    ];

    let path = format!("{}/attachments", self.api_prefix);
    Ok(Request::new("POST", self.resolve(kind, &path)?).with_body(Body::Multipart(parts)))
  }

  /// Upload buffered telemetry in one batch; events are cleared only on success.
  async fn flush_telemetry(&self) -> usize {
    let events = match self.queue.telemetry_events() {
      Ok(events) => events,
      Err(e) => {
        warn!(error = %e, "could not read telemetry events");
        return 0;
      }
    };
    let Some(last_id) = events.last().map(|e| e.id) else {
      return 0;
    };

    let url = match self.origin.join(&self.telemetry_endpoint) {
      Ok(url) => url,
      Err(e) => {
        warn!(endpoint = %self.telemetry_endpoint, error = %e, "bad telemetry endpoint");
        return 0;
      }
    };
    let body = serde_json::json!({ "events": events });
    let request = Request::new("POST", url)
      .with_header("content-type", "application/json")
      .with_body(Body::Bytes(body.to_string().into_bytes()));

    match self.send(request).await {
      Ok(response) if response.is_success() => match self.queue.clear_telemetry(last_id) {
        Ok(cleared) => cleared,
        Err(e) => {
          warn!(error = %e, "could not clear uploaded telemetry");
          0
        }
      },
      Ok(response) => {
        warn!(status = response.status, "telemetry upload rejected");
        0
      }
      Err(e) => {
        warn!(error = %e, "telemetry upload failed");
        0
      }
    }
  }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
  kind: MutationKind,
  payload: &serde_json::Value,
) -> Result<T, SyncError> {
  T::deserialize(payload).map_err(|e| SyncError::InvalidPayload {
    kind,
    message: e.to_string(),
  })
}

fn id_to_string(id: &serde_json::Value) -> String {
  match id {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
