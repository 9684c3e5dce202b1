//! Closed message types exchanged between the application and the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::StoreStats;
use crate::http::{Request, Response};

/// Commands the application sends to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ControlMessage {
  ActivateNow,
  GetVersion,
  GetCacheStats,
  ClearCache {
    #[serde(rename = "cacheName")]
    cache_name: String,
  },
  PrefetchRoutes { routes: Vec<String> },
  OptimizeCaches,
  SyncOfflineData,
}

/// Replies to control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
  Version { version: String },
  CacheStats(BTreeMap<String, StoreStats>),
  Success { success: bool },
}

impl ControlReply {
  pub fn success(success: bool) -> Self {
    ControlReply::Success { success }
  }
}

/// Lifecycle events broadcast to every open application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
  CacheUpdated {
    url: String,
    timestamp: i64,
  },
  SyncCompleted {
    synced_count: usize,
  },
  OperationLogged {
    method: String,
    url: String,
    status: u16,
    timestamp: i64,
  },
  UpdatesAvailable {
    payload: serde_json::Value,
  },
  /// A new version took control of open instances
  ControllerChanged {
    version: String,
  },
  /// Navigate an already-open window (notification click)
  Navigate {
    url: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushKind {
  Silent,
  Update,
  Notification,
}

/// Message delivered by the push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
  pub kind: PushKind,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub payload: serde_json::Value,
}

/// Actions offered on every user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
  View,
  Close,
}

/// A notification the host should display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub url: String,
  pub actions: Vec<NotificationAction>,
}

/// Every event the engine reacts to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
  Install,
  Activate,
  Fetch(Request),
  Message(ControlMessage),
  /// Background sync opportunity with its registration tag
  Sync { tag: String },
  /// Connectivity came back
  Online,
  Push(PushMessage),
  NotificationClick {
    /// `None` when the notification body itself was clicked
    action: Option<NotificationAction>,
    url: String,
  },
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
  Done,
  /// `None` when the request is not intercepted and goes straight to the network
  Response(Option<Response>),
  /// A fetch that failed with neither network nor cache available
  FetchFailed(String),
  Reply(ControlReply),
  ShowNotification(Notification),
  OpenWindow { url: String },
  /// Handling the event failed
  Error(String),
}
