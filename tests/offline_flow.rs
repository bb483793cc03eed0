//! End-to-end: install, go offline, keep working, come back online.

use async_trait::async_trait;
use offline_engine::network::{Request, Response, ServedFrom, Transport};
use offline_engine::sync::TracingNotifier;
use offline_engine::{Config, Database, Engine, Lifecycle, TransportError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Origin {
  pages: Mutex<HashMap<String, Response>>,
  posted: Mutex<Vec<(String, serde_json::Value)>>,
  down: AtomicBool,
}

impl Origin {
  fn serve(&self, url: &str, status: u16, body: &str) {
    self
      .pages
      .lock()
      .unwrap()
      .insert(url.to_string(), Response::new(status, body.to_string()));
  }
}

#[async_trait]
impl Transport for Origin {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    if self.down.load(Ordering::SeqCst) {
      return Err(TransportError::Connect("network unreachable".into()));
    }
    if request.method == reqwest::Method::POST {
      let body = serde_json::from_slice(request.body.as_deref().unwrap_or_default()).unwrap();
      self.posted.lock().unwrap().push((request.url.to_string(), body));
      return Ok(Response::new(201, ""));
    }
    let pages = self.pages.lock().unwrap();
    Ok(pages
      .get(request.url.as_str())
      .cloned()
      .unwrap_or_else(|| Response::new(404, "")))
  }
}

fn url(path: &str) -> url::Url {
  url::Url::parse("https://prices.test/").unwrap().join(path).unwrap()
}

async fn engine(origin: &Arc<Origin>, db: Database) -> Engine {
  let config = Config {
    origin: "https://prices.test/".into(),
    ..Config::default()
  };
  Engine::new(&config, db, origin.clone(), Arc::new(TracingNotifier))
    .await
    .unwrap()
}

#[tokio::test]
async fn works_offline_and_catches_up() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let origin = Arc::new(Origin::default());
  origin.serve("https://prices.test/", 200, "<html>shell</html>");
  origin.serve("https://prices.test/index.html", 200, "<html>shell</html>");
  origin.serve("https://prices.test/offline.html", 200, "<html>offline</html>");
  origin.serve("https://prices.test/api/stores", 200, r#"[{"id":"s1"}]"#);

  let mut engine = engine(&origin, Database::open(&path).unwrap()).await;
  engine.install().await.unwrap();
  engine.activate().await.unwrap();
  assert_eq!(engine.lifecycle(), Lifecycle::Active);

  // Online: API data is fetched and snapshotted
  let served = engine.fetch(Request::get(url("/api/stores"))).await.unwrap();
  assert_eq!(served.source, ServedFrom::Network);

  origin.down.store(true, Ordering::SeqCst);

  // Offline: the shell comes from the precache, API data from the snapshot
  let mut shell = engine.fetch(Request::navigate(url("/"))).await.unwrap();
  assert_eq!(shell.response.text(), "<html>shell</html>");
  shell.settle().await;

  let stores = engine.fetch(Request::get(url("/api/stores"))).await.unwrap();
  assert_eq!(stores.source, ServedFrom::Stale);
  assert_eq!(stores.response.text(), r#"[{"id":"s1"}]"#);

  let unknown = engine.fetch(Request::get(url("/api/prices"))).await.unwrap();
  assert_eq!(unknown.source, ServedFrom::Offline);
  assert_eq!(unknown.response.status, 503);

  // A page never visited falls back to the offline document
  let page = engine.fetch(Request::navigate(url("/stores/s1"))).await.unwrap();
  assert_eq!(page.response.text(), "<html>offline</html>");

  // Writes made offline wait in the queue
  engine
    .save_for_sync("reports", json!({"id": "r1", "storeId": "s1", "price": 3.5}))
    .await
    .unwrap();
  let report = engine.on_sync("sync-reports").await.unwrap().unwrap();
  assert_eq!((report.delivered, report.failed), (0, 1));
  drop(engine);

  // Restart while still offline: the queue and lifecycle persist
  let engine = self::engine(&origin, Database::open(&path).unwrap()).await;
  assert_eq!(engine.lifecycle(), Lifecycle::Active);
  assert_eq!(engine.queue().get_sync_queue().await.unwrap().len(), 1);

  origin.down.store(false, Ordering::SeqCst);
  let report = engine.on_sync("sync-reports").await.unwrap().unwrap();
  assert_eq!(report.delivered, 1);
  assert!(engine.queue().get_sync_queue().await.unwrap().is_empty());

  let posted = origin.posted.lock().unwrap();
  assert_eq!(posted.len(), 1);
  assert_eq!(posted[0].0, "https://prices.test/api/reports");
  assert_eq!(posted[0].1["storeId"], "s1");
}

#[tokio::test]
async fn unrelated_sync_tags_are_ignored() {
  let origin = Arc::new(Origin::default());
  let engine = engine(&origin, Database::open_in_memory().unwrap()).await;
  assert!(engine.on_sync("periodic-refresh").await.unwrap().is_none());
}
