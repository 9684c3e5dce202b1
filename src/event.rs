use color_eyre::{eyre::eyre, Result};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error};

use crate::cache::CacheStorage;
use crate::engine::Engine;
use crate::messages::{EngineEvent, EventOutcome};
use crate::network::Network;

/// An event plus the optional port its outcome is sent back on.
#[derive(Debug)]
pub struct Envelope {
  pub event: EngineEvent,
  pub reply: Option<oneshot::Sender<EventOutcome>>,
}

/// Sending side of the event loop
#[derive(Clone)]
pub struct EngineHandle {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EngineHandle {
  /// Fire an event without waiting for it to be handled.
  pub fn send(&self, event: EngineEvent) -> Result<()> {
    self
      .tx
      .send(Envelope { event, reply: None })
      .map_err(|_| eyre!("Event loop has stopped"))
  }

  /// Send an event and wait for its outcome.
  pub async fn request(&self, event: EngineEvent) -> Result<EventOutcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        event,
        reply: Some(reply),
      })
      .map_err(|_| eyre!("Event loop has stopped"))?;
    rx.await
      .map_err(|_| eyre!("Event handler dropped its reply"))
  }
}

/// Start the event loop for `engine`.
///
/// Every event is handled on its own task so a slow fetch never blocks the
/// next one. A periodic tick runs the optimize pass. The loop ends once every
/// handle is dropped.
pub fn spawn_event_loop<S, N>(engine: Arc<Engine<S, N>>) -> (EngineHandle, JoinHandle<()>)
where
  S: CacheStorage + 'static,
  N: Network,
{
  let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
  let period = Duration::from_secs(engine.config().optimize_interval_secs);

  let task = tokio::spawn(async move {
    let mut tick = (!period.is_zero()).then(|| interval_at(Instant::now() + period, period));

    loop {
      tokio::select! {
        envelope = rx.recv() => match envelope {
          Some(envelope) => handle(Arc::clone(&engine), envelope),
          None => break,
        },
        _ = next_tick(&mut tick) => {
          let removed = engine.optimize();
          debug!(removed, "periodic optimize");
        }
      }
    }
    debug!("event loop stopped");
  });

  (EngineHandle { tx }, task)
}

fn handle<S, N>(engine: Arc<Engine<S, N>>, envelope: Envelope)
where
  S: CacheStorage + 'static,
  N: Network,
{
  tokio::spawn(async move {
    let Envelope { event, reply } = envelope;
    let outcome = match engine.dispatch(event).await {
      Ok(outcome) => outcome,
      Err(e) => {
        error!(error = %e, "event handler failed");
        EventOutcome::Error(e.to_string())
      }
    };
    if let Some(reply) = reply {
      // The requester may have given up waiting
      let _ = reply.send(outcome);
    }
  });
}

async fn next_tick(tick: &mut Option<Interval>) {
  match tick {
    Some(interval) => {
      interval.tick().await;
    }
    None => future::pending().await,
  }
}
