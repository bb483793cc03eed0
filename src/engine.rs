//! Engine root: owns the store and wires the cache, queue, router, and
//! coordinator together. Also runs the install/activate lifecycle and the
//! control-message protocol.

use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::{Ttl, TtlCache, CACHE_PARTITION};
use crate::config::{Config, PartitionConfig};
use crate::db::Database;
use crate::error::{EngineError, RouteError};
use crate::network::cache::RESPONSE_PARTITIONS;
use crate::network::{
  HttpTransport, Request, ResponseCache, RouteRules, Router, Served, Transport, DYNAMIC_PARTITION,
  STATIC_PARTITION,
};
use crate::store::LocalStore;
use crate::sync::{
  ClickOutcome, Coordinator, DrainReport, Notification, NotificationHost, SyncQueue, TracingNotifier,
};

/// Cache key remembering how far the lifecycle has progressed.
const LIFECYCLE_KEY: &str = "lifecycle";

/// Install/activate progress. Requests are only intercepted once active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
  /// Nothing has run yet
  Registered,
  /// Install completed or was skipped
  Installed,
  /// Intercepting requests
  Active,
}

/// Control messages from the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Delete every store partition
  ClearCache,
  /// Fetch these URLs into the dynamic partition
  CacheUrls { urls: Vec<String> },
}

impl ControlMessage {
  pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Message(e.to_string()))
  }
}

/// Result of a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
  Cleared { partitions: usize },
  Cached { cached: usize, failed: Vec<String> },
}

pub struct Engine {
  store: LocalStore,
  cache: TtlCache,
  queue: SyncQueue,
  router: Router,
  coordinator: Coordinator,
  partitions: Vec<PartitionConfig>,
  precache: Vec<String>,
  sweep_interval: Option<Duration>,
  lifecycle: Lifecycle,
}

impl Engine {
  /// Build an engine over `db`, opening every known partition.
  pub async fn new(
    config: &Config,
    db: Database,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn NotificationHost>,
  ) -> Result<Self, EngineError> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| EngineError::Config(format!("invalid origin {:?}: {e}", config.origin)))?;

    let store = LocalStore::new(db);
    let cache = TtlCache::open(store.clone())
      .await?
      .with_default_ttl(Ttl::After(config.default_ttl()));
    let responses = ResponseCache::open(store.clone()).await?;
    let queue = SyncQueue::new(cache.clone());

    let rules = RouteRules {
      origin,
      tile_hosts: config.routes.tile_hosts.clone(),
      tile_prefixes: config.routes.tile_prefixes.clone(),
      api_prefixes: config.routes.api_prefixes.clone(),
    };
    let router = Router::new(transport, responses, rules)
      .with_timeout(config.request_timeout())
      .with_offline_page(config.offline_page.clone());

    let coordinator = Coordinator::new(store.clone(), queue.clone(), router.clone(), notifier)
      .with_sync_tag(config.sync.tag.clone())
      .with_endpoints(config.sync.endpoints.clone())
      .with_default_title(config.notifications.default_title.clone());

    let mut engine = Self {
      store,
      cache,
      queue,
      router,
      coordinator,
      partitions: config.partitions.clone(),
      precache: config.precache.clone(),
      sweep_interval: config.sweep_interval(),
      lifecycle: Lifecycle::Registered,
    };
    engine.open_partitions().await?;
    engine.lifecycle = engine
      .cache
      .get_cache(LIFECYCLE_KEY)
      .await?
      .unwrap_or(Lifecycle::Registered);

    info!(lifecycle = ?engine.lifecycle, "engine ready");
    Ok(engine)
  }

  /// Engine over the configured database file, talking HTTP, with
  /// notifications going to the log.
  pub async fn open(config: &Config) -> Result<Self, EngineError> {
    let path = config
      .database_path()
      .map_err(|e| EngineError::Config(e.to_string()))?;
    let db = Database::open(path)?;
    let transport = HttpTransport::new(config.request_timeout())
      .map_err(|e| EngineError::Config(e.to_string()))?;
    Self::new(config, db, Arc::new(transport), Arc::new(TracingNotifier)).await
  }

  async fn open_partitions(&self) -> Result<(), EngineError> {
    for partition in RESPONSE_PARTITIONS {
      self.store.open_partition(partition, "key", &["url"]).await?;
    }
    self.store.open_partition(CACHE_PARTITION, "key", &[]).await?;
    for partition in &self.partitions {
      let indexes: Vec<&str> = partition.indexes.iter().map(String::as_str).collect();
      self
        .store
        .open_partition(&partition.name, &partition.primary_key, &indexes)
        .await?;
    }
    Ok(())
  }

  fn known_partitions(&self) -> Vec<String> {
    RESPONSE_PARTITIONS
      .iter()
      .map(|s| s.to_string())
      .chain(std::iter::once(CACHE_PARTITION.to_string()))
      .chain(self.partitions.iter().map(|p| p.name.clone()))
      .collect()
  }

  async fn set_lifecycle(&mut self, lifecycle: Lifecycle) -> Result<(), EngineError> {
    self.cache.set_cache(LIFECYCLE_KEY, &lifecycle, Some(Ttl::Forever)).await?;
    self.lifecycle = lifecycle;
    info!(?lifecycle, "lifecycle changed");
    Ok(())
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self.lifecycle
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  pub fn cache(&self) -> &TtlCache {
    &self.cache
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  /// Precache the manifest into the static partition. Every path must
  /// answer with a 2xx or nothing is stored.
  pub async fn install(&mut self) -> Result<usize, EngineError> {
    if self.lifecycle == Lifecycle::Active {
      return Err(EngineError::Lifecycle("engine is already active".into()));
    }

    let origin = &self.router.rules().origin;
    let requests = self
      .precache
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map(Request::get)
          .map_err(|e| EngineError::Config(format!("invalid precache path {path:?}: {e}")))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let responses = try_join_all(requests.iter().map(|r| self.router.fetch_network(r)))
      .await
      .map_err(RouteError::from)?;

    if let Some((request, response)) = requests
      .iter()
      .zip(&responses)
      .find(|(_, response)| !response.is_success())
    {
      return Err(EngineError::Lifecycle(format!(
        "precache of {} returned {}",
        request.url, response.status
      )));
    }

    for (request, response) in requests.iter().zip(&responses) {
      self.router.cache().save(STATIC_PARTITION, request, response).await?;
    }

    info!(assets = requests.len(), "install complete");
    self.set_lifecycle(Lifecycle::Installed).await?;
    Ok(requests.len())
  }

  /// Mark install as done without precaching.
  pub async fn skip_install(&mut self) -> Result<(), EngineError> {
    if self.lifecycle == Lifecycle::Registered {
      self.set_lifecycle(Lifecycle::Installed).await?;
    }
    Ok(())
  }

  /// Delete partitions outside the known set and start intercepting.
  /// Returns the deleted partition names.
  pub async fn activate(&mut self) -> Result<Vec<String>, EngineError> {
    if self.lifecycle == Lifecycle::Registered {
      return Err(EngineError::Lifecycle(
        "install has not completed or been skipped".into(),
      ));
    }

    let known = self.known_partitions();
    let mut removed = Vec::new();
    for name in self.store.partition_names().await? {
      if !known.contains(&name) {
        self.store.delete_partition(&name).await?;
        removed.push(name);
      }
    }

    if !removed.is_empty() {
      info!(?removed, "removed obsolete partitions");
    }
    self.set_lifecycle(Lifecycle::Active).await?;
    Ok(removed)
  }

  /// Route one request. Before activation requests go straight to the
  /// network.
  pub async fn fetch(&self, request: Request) -> Result<Served, RouteError> {
    if self.lifecycle == Lifecycle::Active {
      self.router.handle(request).await
    } else {
      self.router.passthrough(request).await
    }
  }

  /// Write `record` locally and queue it for delivery.
  pub async fn save_for_sync(&self, partition: &str, record: Value) -> Result<String, EngineError> {
    let key = self.store.put(partition, record).await?;
    self.queue.mark_for_sync(partition, &key).await?;
    Ok(key)
  }

  pub async fn handle_message(&mut self, message: ControlMessage) -> Result<MessageOutcome, EngineError> {
    match message {
      ControlMessage::ClearCache => self.clear_cache().await,
      ControlMessage::CacheUrls { urls } => self.cache_urls(urls).await,
    }
  }

  async fn clear_cache(&mut self) -> Result<MessageOutcome, EngineError> {
    let pending = self.queue.get_sync_queue().await?.len();
    if pending > 0 {
      warn!(pending, "clearing the store discards queued sync operations");
    }

    let names = self.store.partition_names().await?;
    for name in &names {
      self.store.delete_partition(name).await?;
    }
    info!(partitions = names.len(), "cleared all partitions");

    // Keep the engine usable: empty partitions, same lifecycle
    self.open_partitions().await?;
    let lifecycle = self.lifecycle;
    self.set_lifecycle(lifecycle).await?;

    Ok(MessageOutcome::Cleared {
      partitions: names.len(),
    })
  }

  async fn cache_urls(&self, urls: Vec<String>) -> Result<MessageOutcome, EngineError> {
    let origin = &self.router.rules().origin;
    let mut failed = Vec::new();
    let mut requests = Vec::new();
    for url in urls {
      match origin.join(&url) {
        Ok(resolved) => requests.push(Request::get(resolved)),
        Err(e) => {
          warn!(url = %url, error = %e, "skipping invalid url");
          failed.push(url);
        }
      }
    }

    let results = join_all(requests.iter().map(|r| self.router.fetch_network(r))).await;
    let mut fetched = Vec::new();
    for (request, result) in requests.into_iter().zip(results) {
      match result {
        Ok(response) => fetched.push((request, response)),
        Err(e) => {
          warn!(url = %request.url, error = %e, "failed to fetch url for caching");
          failed.push(request.url.to_string());
        }
      }
    }

    let report = self.router.cache().save_many(DYNAMIC_PARTITION, &fetched).await?;
    failed.extend(report.failures.iter().map(|f| fetched[f.index].0.url.to_string()));

    Ok(MessageOutcome::Cached {
      cached: report.succeeded,
      failed,
    })
  }

  /// Background-sync trigger.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<DrainReport>, EngineError> {
    Ok(self.coordinator.on_sync(tag).await?)
  }

  pub fn on_push(&self, payload: &[u8]) -> Notification {
    self.coordinator.on_push(payload)
  }

  pub fn on_notification_click(&self, action: Option<&str>, notification: &Notification) -> ClickOutcome {
    self.coordinator.on_notification_click(action, notification)
  }

  /// Start the periodic cache sweep when configured.
  pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
    self.sweep_interval.map(|interval| self.cache.spawn_sweeper(interval))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::testing::FakeTransport;
  use crate::network::{Response, ServedFrom};
  use serde_json::json;

  async fn engine(transport: &Arc<FakeTransport>) -> Engine {
    engine_on(transport, Database::open_in_memory().unwrap()).await
  }

  async fn engine_on(transport: &Arc<FakeTransport>, db: Database) -> Engine {
    let config = Config {
      origin: "https://app.test/".into(),
      ..Config::default()
    };
    Engine::new(&config, db, transport.clone(), Arc::new(TracingNotifier))
      .await
      .unwrap()
  }

  fn serve_shell(transport: &FakeTransport) {
    for path in ["", "index.html", "offline.html"] {
      transport.respond(
        &format!("https://app.test/{path}"),
        Response::new(200, format!("shell:{path}")),
      );
    }
  }

  #[tokio::test]
  async fn install_precaches_manifest() {
    let transport = Arc::new(FakeTransport::default());
    serve_shell(&transport);
    let mut engine = engine(&transport).await;

    assert_eq!(engine.install().await.unwrap(), 3);
    assert_eq!(engine.lifecycle(), Lifecycle::Installed);
    assert_eq!(engine.store().get_all(STATIC_PARTITION).await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn install_fails_when_offline() {
    let transport = Arc::new(FakeTransport::default());
    transport.set_offline(true);
    let mut engine = engine(&transport).await;

    assert!(engine.install().await.is_err());
    assert_eq!(engine.lifecycle(), Lifecycle::Registered);
    assert!(engine.store().get_all(STATIC_PARTITION).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn install_rejects_error_status() {
    let transport = Arc::new(FakeTransport::default());
    transport.respond("https://app.test/", Response::new(200, "ok"));
    let mut engine = engine(&transport).await;

    let err = engine.install().await.unwrap_err();
    assert!(matches!(err, EngineError::Lifecycle(_)));
  }

  #[tokio::test]
  async fn activate_requires_install() {
    let transport = Arc::new(FakeTransport::default());
    let mut engine = engine(&transport).await;
    assert!(matches!(engine.activate().await, Err(EngineError::Lifecycle(_))));

    engine.skip_install().await.unwrap();
    engine.activate().await.unwrap();
    assert_eq!(engine.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn activate_deletes_unknown_partitions() {
    let transport = Arc::new(FakeTransport::default());
    let mut engine = engine(&transport).await;
    engine.store().open_partition("static-v1", "key", &[]).await.unwrap();

    engine.skip_install().await.unwrap();
    let removed = engine.activate().await.unwrap();
    assert_eq!(removed, vec!["static-v1"]);

    let names = engine.store().partition_names().await.unwrap();
    for expected in ["cache", "dynamic", "prices", "reports", "static", "stores", "tiles"] {
      assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
  }

  #[tokio::test]
  async fn requests_pass_through_until_active() {
    let transport = Arc::new(FakeTransport::default());
    let mut engine = engine(&transport).await;
    let request = Request::get(Url::parse("https://app.test/api/stores").unwrap());
    transport.respond(request.url.as_str(), Response::new(200, "[]"));

    engine.fetch(request.clone()).await.unwrap();
    assert!(engine.store().get_all(DYNAMIC_PARTITION).await.unwrap().is_empty());

    engine.skip_install().await.unwrap();
    engine.activate().await.unwrap();
    engine.fetch(request).await.unwrap();
    assert_eq!(engine.store().get_all(DYNAMIC_PARTITION).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn lifecycle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let transport = Arc::new(FakeTransport::default());

    {
      let mut engine = engine_on(&transport, Database::open(&path).unwrap()).await;
      engine.skip_install().await.unwrap();
      engine.activate().await.unwrap();
    }

    let engine = engine_on(&transport, Database::open(&path).unwrap()).await;
    assert_eq!(engine.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn open_uses_configured_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("engine.db");
    let config = Config {
      origin: "https://app.test/".into(),
      database: Some(path.clone()),
      ..Config::default()
    };

    let engine = Engine::open(&config).await.unwrap();
    assert_eq!(engine.lifecycle(), Lifecycle::Registered);
    assert!(path.exists());
  }

  #[tokio::test]
  async fn clear_cache_empties_every_partition() {
    let transport = Arc::new(FakeTransport::default());
    let mut engine = engine(&transport).await;
    engine.skip_install().await.unwrap();
    engine.activate().await.unwrap();
    engine
      .save_for_sync("reports", json!({"id": "r1"}))
      .await
      .unwrap();

    let message = ControlMessage::parse(br#"{"type":"CLEAR_CACHE"}"#).unwrap();
    let outcome = engine.handle_message(message).await.unwrap();
    assert!(matches!(outcome, MessageOutcome::Cleared { partitions } if partitions >= 7));

    assert!(engine.store().get("reports", "r1").await.unwrap().is_none());
    assert!(engine.queue().get_sync_queue().await.unwrap().is_empty());
    assert_eq!(engine.lifecycle(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn cache_urls_reports_failures() {
    let transport = Arc::new(FakeTransport::default());
    transport.respond("https://app.test/api/stores", Response::new(200, "[]"));
    transport.fail("https://app.test/api/prices");
    let mut engine = engine(&transport).await;

    let message = ControlMessage::parse(
      br#"{"type":"CACHE_URLS","urls":["/api/stores","/api/prices"]}"#,
    )
    .unwrap();
    let outcome = engine.handle_message(message).await.unwrap();
    assert_eq!(
      outcome,
      MessageOutcome::Cached {
        cached: 1,
        failed: vec!["https://app.test/api/prices".to_string()],
      }
    );
  }

  #[tokio::test]
  async fn cached_urls_serve_offline() {
    let transport = Arc::new(FakeTransport::default());
    transport.respond("https://app.test/api/stores", Response::new(200, "[1]"));
    let mut engine = engine(&transport).await;
    engine.skip_install().await.unwrap();
    engine.activate().await.unwrap();
    engine
      .handle_message(ControlMessage::CacheUrls {
        urls: vec!["/api/stores".into()],
      })
      .await
      .unwrap();

    transport.set_offline(true);
    let served = engine
      .fetch(Request::get(Url::parse("https://app.test/api/stores").unwrap()))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Stale);
    assert_eq!(served.response.text(), "[1]");
  }

  #[test]
  fn malformed_message_is_rejected() {
    assert!(matches!(
      ControlMessage::parse(br#"{"type":"REBOOT"}"#),
      Err(EngineError::Message(_))
    ));
    assert!(ControlMessage::parse(b"{").is_err());
  }

  #[tokio::test]
  async fn save_for_sync_queues_record() {
    let transport = Arc::new(FakeTransport::default());
    let engine = engine(&transport).await;
    let key = engine
      .save_for_sync("reports", json!({"id": "r9", "storeId": "s1"}))
      .await
      .unwrap();
    assert_eq!(key, "r9");

    let queue = engine.queue().get_sync_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].target_store, "reports");

    transport.respond("https://app.test/api/reports", Response::new(201, ""));
    let report = engine.on_sync("sync-reports").await.unwrap().unwrap();
    assert_eq!(report.delivered, 1);
  }
}
