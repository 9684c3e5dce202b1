use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use shelter::config::{self, Config};
use shelter::engine::INSTALLED_VERSION_SETTING;
use shelter::event::{spawn_event_loop, EngineHandle};
use shelter::messages::{ControlMessage, EngineEvent, EventOutcome};
use shelter::queue::{MutationKind, MutationQueue};
use shelter::{Engine, HttpNetwork, Request, Response, SqliteStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shelter")]
#[command(about = "Offline-first caching and sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shelter.yaml, then $XDG_CONFIG_HOME/shelter/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the core assets for the configured version
  Install,
  /// Activate the configured version, deleting older generations
  Activate,
  /// Serve a request through the engine
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Accept header to send
    #[arg(short, long)]
    accept: Option<String>,
    /// Treat the request as a page navigation
    #[arg(short, long)]
    navigate: bool,
  },
  /// Show entry counts and sizes per cache store
  Stats,
  /// Delete a named cache store
  Clear { cache: String },
  /// Fetch routes into their caches ahead of time
  Prefetch { routes: Vec<String> },
  /// Delete entries older than the configured maximum age
  Optimize,
  /// Replay queued offline mutations
  Sync,
  /// Print the engine version
  Version,
  /// Queue a mutation for the next sync
  Enqueue {
    /// request-replay, form-submission or attachment-upload
    kind: String,
    /// JSON payload
    payload: String,
  },
  /// List queued mutations
  Queue,
  /// Buffer a telemetry event for upload on the next sync
  Log {
    /// debug, info, warn or error
    level: String,
    message: String,
    /// JSON context attached to the event
    #[arg(long)]
    context: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;

  let storage = Arc::new(SqliteStorage::open(&db_path)?);
  let queue = Arc::new(MutationQueue::open(&db_path)?);
  let network = Arc::new(HttpNetwork::new()?);
  let engine = Arc::new(Engine::new(config, storage, network, Arc::clone(&queue))?);
  let (handle, _loop) = spawn_event_loop(Arc::clone(&engine));

  let output = match args.command {
    Command::Install => outcome_json(handle.request(EngineEvent::Install).await?),
    Command::Activate => outcome_json(handle.request(EngineEvent::Activate).await?),
    Command::Fetch {
      url,
      method,
      accept,
      navigate,
    } => {
      let url = engine
        .config()
        .origin_url()?
        .join(&url)
        .map_err(|e| eyre!("Invalid url {}: {}", url, e))?;
      let mut request = Request::new(&method, url);
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }
      if navigate {
        request = request.navigation();
      }
      ensure_active(&handle, &queue, engine.version()).await?;
      outcome_json(handle.request(EngineEvent::Fetch(request)).await?)
    }
    Command::Stats => control(&handle, ControlMessage::GetCacheStats).await?,
    Command::Clear { cache } => {
      control(&handle, ControlMessage::ClearCache { cache_name: cache }).await?
    }
    Command::Prefetch { routes } => {
      control(&handle, ControlMessage::PrefetchRoutes { routes }).await?
    }
    Command::Optimize => control(&handle, ControlMessage::OptimizeCaches).await?,
    Command::Sync => control(&handle, ControlMessage::SyncOfflineData).await?,
    Command::Version => control(&handle, ControlMessage::GetVersion).await?,
    Command::Enqueue { kind, payload } => {
      if MutationKind::parse(&kind).is_none() {
        tracing::warn!(%kind, "queueing a mutation kind this engine cannot replay");
      }
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      serde_json::to_value(queue.enqueue(&kind, payload)?)?
    }
    Command::Queue => serde_json::to_value(queue.pending()?)?,
    Command::Log {
      level,
      message,
      context,
    } => {
      let context: Value = match context {
        Some(raw) => {
          serde_json::from_str(&raw).map_err(|e| eyre!("Invalid JSON context: {}", e))?
        }
        None => json!({}),
      };
      json!({ "id": engine.log_event(&level, &message, context)? })
    }
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

/// Log to a daily file under the data directory, optionally mirrored to stderr.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "shelter.log",
  ));
  let filter = EnvFilter::try_from_env("SHELTER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}

/// Each invocation starts a fresh engine: install if this version never was, then activate.
async fn ensure_active(handle: &EngineHandle, queue: &MutationQueue, version: &str) -> Result<()> {
  let installed: Option<String> = queue.get_setting(INSTALLED_VERSION_SETTING)?;
  if installed.as_deref() != Some(version) {
    expect_done(handle.request(EngineEvent::Install).await?)?;
  }
  expect_done(handle.request(EngineEvent::Activate).await?)
}

fn expect_done(outcome: EventOutcome) -> Result<()> {
  match outcome {
    EventOutcome::Error(e) => Err(eyre!(e)),
    _ => Ok(()),
  }
}

async fn control(handle: &EngineHandle, message: ControlMessage) -> Result<Value> {
  match handle.request(EngineEvent::Message(message)).await? {
    EventOutcome::Reply(reply) => Ok(serde_json::to_value(reply)?),
    other => Ok(outcome_json(other)),
  }
}

fn outcome_json(outcome: EventOutcome) -> Value {
  match outcome {
    EventOutcome::Done => json!({ "success": true }),
    EventOutcome::Response(Some(response)) => response_json(&response),
    EventOutcome::Response(None) => json!({ "intercepted": false }),
    EventOutcome::FetchFailed(error) => json!({ "error": error }),
    EventOutcome::Reply(reply) => serde_json::to_value(reply).unwrap_or(Value::Null),
    EventOutcome::ShowNotification(notification) => {
      serde_json::to_value(notification).unwrap_or(Value::Null)
    }
    EventOutcome::OpenWindow { url } => json!({ "openWindow": url }),
    EventOutcome::Error(error) => json!({ "success": false, "error": error }),
  }
}

fn response_json(response: &Response) -> Value {
  json!({
    "status": response.status,
    "headers": response.headers,
    "body": String::from_utf8_lossy(&response.body),
  })
}
