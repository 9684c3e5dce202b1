//! Broadcast of lifecycle events to open application instances.

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::messages::ClientEvent;

const CHANNEL_CAPACITY: usize = 128;

/// Fans [`ClientEvent`]s out to every subscribed application instance.
#[derive(Clone)]
pub struct ClientNotifier {
  tx: broadcast::Sender<ClientEvent>,
  /// Version currently controlling the open instances
  controller: Arc<RwLock<Option<String>>>,
}

impl Default for ClientNotifier {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientNotifier {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      tx,
      controller: Arc::new(RwLock::new(None)),
    }
  }

  /// Register an application instance.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.tx.subscribe()
  }

  /// Number of open application instances.
  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Fire-and-forget broadcast; returns how many instances received it.
  pub fn broadcast(&self, event: ClientEvent) -> usize {
    match self.tx.send(event) {
      Ok(delivered) => delivered,
      Err(broadcast::error::SendError(event)) => {
        debug!(?event, "no open clients to notify");
        0
      }
    }
  }

  /// Take control of every open instance on behalf of `version`.
  pub fn claim(&self, version: &str) -> usize {
    if let Ok(mut controller) = self.controller.write() {
      *controller = Some(version.to_string());
    }
    self.broadcast(ClientEvent::ControllerChanged {
      version: version.to_string(),
    })
  }

  pub fn controller(&self) -> Option<String> {
    self.controller.read().ok().and_then(|c| c.clone())
  }
}
