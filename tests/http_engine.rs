use serde_json::json;
use shelter::cache::CacheSource;
use shelter::engine::LifecycleState;
use shelter::{Config, Engine, HttpNetwork, MutationQueue, Request, SqliteStorage};
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Setup {
  engine: Engine<SqliteStorage, HttpNetwork>,
  queue: Arc<MutationQueue>,
  _dir: TempDir,
}

async fn setup(server: &MockServer, core_assets: &[&str]) -> Setup {
  let dir = TempDir::new().unwrap();
  let db = dir.path().join("shelter.db");
  let config = Config {
    origin: server.uri(),
    version: "v1".to_string(),
    cache_prefix: "it".to_string(),
    core_assets: core_assets.iter().map(|s| s.to_string()).collect(),
    ..Config::default()
  };
  let queue = Arc::new(MutationQueue::open(&db).unwrap());
  let engine = Engine::new(
    config,
    Arc::new(SqliteStorage::open(&db).unwrap()),
    Arc::new(HttpNetwork::new().unwrap()),
    Arc::clone(&queue),
  )
  .unwrap();
  Setup {
    engine,
    queue,
    _dir: dir,
  }
}

fn request(server: &MockServer, route: &str) -> Request {
  Request::get(Url::parse(&server.uri()).unwrap().join(route).unwrap())
}

async fn page(server: &MockServer, route: &str, body: &str) {
  Mock::given(method("GET"))
    .and(path(route))
    .respond_with(
      ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body),
    )
    .mount(server)
    .await;
}

#[tokio::test]
async fn test_install_activate_and_serve_from_cache() {
  let server = MockServer::start().await;
  page(&server, "/", "<h1>home</h1>").await;
  page(&server, "/offline", "<h1>offline</h1>").await;
  Mock::given(method("GET"))
    .and(path("/assets/app.js"))
    .respond_with(ResponseTemplate::new(200).set_body_string("console.log(1)"))
    .expect(1)
    .mount(&server)
    .await;

  let s = setup(&server, &["/", "/offline"]).await;
  s.engine.install().await.unwrap();
  s.engine.activate().unwrap();
  assert_eq!(s.engine.state(), LifecycleState::Active);

  let first = s
    .engine
    .handle_fetch(&request(&server, "/assets/app.js"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(first.source, CacheSource::Network);

  let second = s
    .engine
    .handle_fetch(&request(&server, "/assets/app.js"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(second.source, CacheSource::CacheFresh);
  assert_eq!(second.data.body, b"console.log(1)");
}

#[tokio::test]
async fn test_server_errors_are_returned_but_not_cached() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/api/visits"))
    .respond_with(ResponseTemplate::new(500))
    .mount(&server)
    .await;

  let s = setup(&server, &[]).await;
  s.engine.install().await.unwrap();
  s.engine.activate().unwrap();

  let result = s
    .engine
    .handle_fetch(&request(&server, "/api/visits"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(result.data.status, 500);

  let stats = s.engine.cache().stats().unwrap();
  assert!(stats.get("it-api-v1").map_or(true, |store| store.count == 0));
}

#[tokio::test]
async fn test_sync_replays_queued_mutations() {
  let server = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/api/visits"))
    .and(body_json(json!({"notes": "checked"})))
    .respond_with(ResponseTemplate::new(201))
    .expect(1)
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path("/api/attachments"))
    .respond_with(ResponseTemplate::new(201))
    .expect(1)
    .mount(&server)
    .await;

  let s = setup(&server, &[]).await;
  s.queue
    .enqueue(
      "form-submission",
      json!({"table": "visits", "record": {"notes": "checked"}}),
    )
    .unwrap();
  s.queue
    .enqueue(
      "attachment-upload",
      json!({
        "table": "visits",
        "record_id": 7,
        "file_name": "photo.jpg",
        "content_type": "image/jpeg",
        "data": "aGVsbG8="
      }),
    )
    .unwrap();

  let report = s.engine.sync_offline_data().await.unwrap();
  assert_eq!(report.synced, 2);
  assert!(s.queue.is_empty().unwrap());
}

#[tokio::test]
async fn test_rejected_mutation_stays_queued() {
  let server = MockServer::start().await;
  Mock::given(method("PUT"))
    .and(path("/api/visits/3"))
    .respond_with(ResponseTemplate::new(409))
    .mount(&server)
    .await;

  let s = setup(&server, &[]).await;
  let queued = s
    .queue
    .enqueue(
      "form-submission",
      json!({"table": "visits", "id": 3, "method": "PUT", "record": {}}),
    )
    .unwrap();

  let report = s.engine.sync_offline_data().await.unwrap();
  assert_eq!(report.failed, 1);
  let item = s.queue.get(&queued.id).unwrap().unwrap();
  assert_eq!(item.retry_count, 1);
  assert!(item.last_error.unwrap().contains("409"));
}
