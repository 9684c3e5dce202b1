//! Observation point for fire-and-forget background work.
//!
//! Background refreshes never report failure to the request that started them.
//! Instead each one produces a [`TaskReport`] that is logged and published here,
//! so the swallow-on-failure contract stays observable in tests and in the logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Which background job ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundTask {
  /// Cache-first refresh of an entry past the refresh threshold
  Refresh { store: String, url: String },
  /// Stale-while-revalidate fetch
  Revalidate { store: String, url: String },
  /// Route fetched by a prefetch command
  Prefetch { url: String },
}

impl fmt::Display for BackgroundTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackgroundTask::Refresh { url, .. } => write!(f, "refresh {}", url),
      BackgroundTask::Revalidate { url, .. } => write!(f, "revalidate {}", url),
      BackgroundTask::Prefetch { url } => write!(f, "prefetch {}", url),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
  /// The response was fetched and written to its store
  Updated,
  /// The network answered but the response was not cacheable
  Skipped { status: u16 },
  Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
  pub task: BackgroundTask,
  pub outcome: TaskOutcome,
}

const CHANNEL_CAPACITY: usize = 256;

/// Sink that background tasks report to.
#[derive(Clone)]
pub struct Diagnostics {
  tx: broadcast::Sender<TaskReport>,
  completed: Arc<AtomicU64>,
  failed: Arc<AtomicU64>,
}

impl Default for Diagnostics {
  fn default() -> Self {
    Self::new()
  }
}

impl Diagnostics {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      tx,
      completed: Arc::new(AtomicU64::new(0)),
      failed: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn record(&self, report: TaskReport) {
    match &report.outcome {
      TaskOutcome::Failed(error) => {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(task = %report.task, error = %error, "background task failed");
      }
      TaskOutcome::Updated => {
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(task = %report.task, "background task updated cache");
      }
      TaskOutcome::Skipped { status } => {
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(task = %report.task, status, "background task skipped non-cacheable response");
      }
    }
    // No subscribers is fine
    let _ = self.tx.send(report);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<TaskReport> {
    self.tx.subscribe()
  }

  pub fn completed(&self) -> u64 {
    self.completed.load(Ordering::Relaxed)
  }

  pub fn failed(&self) -> u64 {
    self.failed.load(Ordering::Relaxed)
  }
}
