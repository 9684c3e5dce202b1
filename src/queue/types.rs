//! Records held by the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of mutation kinds the sync coordinator knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
  /// Re-issue a captured HTTP request verbatim
  RequestReplay,
  /// Re-submit a form record to its table endpoint
  FormSubmission,
  /// Re-upload a file as multipart form data
  AttachmentUpload,
}

impl MutationKind {
  pub const ALL: [MutationKind; 3] = [
    MutationKind::RequestReplay,
    MutationKind::FormSubmission,
    MutationKind::AttachmentUpload,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::RequestReplay => "request-replay",
      MutationKind::FormSubmission => "form-submission",
      MutationKind::AttachmentUpload => "attachment-upload",
    }
  }

  /// Parse a stored kind; `None` for kinds this engine does not know.
  pub fn parse(kind: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.as_str() == kind)
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A state-changing operation captured while offline.
///
/// `kind` stays a string so items written by other producers survive even
/// when this engine cannot replay them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineMutation {
  pub id: String,
  pub kind: String,
  pub payload: serde_json::Value,
  pub retry_count: u32,
  pub last_error: Option<String>,
  pub last_retry_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
}

/// Work postponed until the next sync opportunity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredTask {
  pub id: String,
  pub tag: String,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
  pub id: i64,
  pub level: String,
  pub message: String,
  pub context: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

/// A queued row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableMutation {
  pub id: String,
  pub error: String,
}

/// Result of reading the whole mutation queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueScan {
  pub mutations: Vec<OfflineMutation>,
  pub unreadable: Vec<UnreadableMutation>,
}
