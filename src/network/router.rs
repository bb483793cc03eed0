//! Request interception: classify each request and run its caching
//! strategy against the network and the response partitions.

use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::cache::{ResponseCache, DYNAMIC_PARTITION, STATIC_PARTITION, TILES_PARTITION};
use super::client::Transport;
use super::types::{Request, RequestMode, Response, Served, ServedFrom};
use crate::error::{RouteError, TransportError};

/// Status of the synthesized offline response.
pub const OFFLINE_STATUS: u16 = 503;

/// Body of the synthesized offline response.
pub const OFFLINE_BODY: &str =
  r#"{"error":"offline","message":"You are offline and this data has not been cached yet."}"#;

/// Used for navigations when no offline page was precached.
const OFFLINE_DOCUMENT: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available without a connection.</p></body></html>\n";

/// Resource class of a request; decides the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Bulk read-only assets such as map tiles: cache-first
  Tile,
  /// Live API reads: network-first
  Api,
  /// Application shell assets: stale-while-revalidate
  Static,
  /// Writes and foreign origins: straight to the network
  Bypass,
}

/// Rules mapping requests to resource classes.
#[derive(Debug, Clone)]
pub struct RouteRules {
  pub origin: Url,
  /// Hosts (and their subdomains) serving tiles
  pub tile_hosts: Vec<String>,
  /// Same-origin path prefixes serving tiles
  pub tile_prefixes: Vec<String>,
  /// Same-origin path prefixes of the REST API
  pub api_prefixes: Vec<String>,
}

impl RouteRules {
  pub fn classify(&self, request: &Request) -> ResourceClass {
    if request.method != Method::GET {
      return ResourceClass::Bypass;
    }

    let url = &request.url;
    let host = url.host_str().unwrap_or_default();
    let tile_host = self
      .tile_hosts
      .iter()
      .any(|h| host == h || host.ends_with(&format!(".{h}")));
    if tile_host {
      return ResourceClass::Tile;
    }

    if url.origin() != self.origin.origin() {
      return ResourceClass::Bypass;
    }

    let path = url.path();
    if self.tile_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      ResourceClass::Tile
    } else if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      ResourceClass::Api
    } else {
      ResourceClass::Static
    }
  }
}

/// Runs the caching strategy for each request.
///
/// Holds no state of its own beyond handles; clones share the transport
/// and the store.
#[derive(Clone)]
pub struct Router {
  transport: Arc<dyn Transport>,
  cache: ResponseCache,
  rules: Arc<RouteRules>,
  timeout: Duration,
  offline_page: String,
}

impl Router {
  pub fn new(transport: Arc<dyn Transport>, cache: ResponseCache, rules: RouteRules) -> Self {
    Self {
      transport,
      cache,
      rules: Arc::new(rules),
      timeout: Duration::from_secs(10),
      offline_page: "/offline.html".to_string(),
    }
  }

  /// Default bound on every network call.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Path of the precached document served to offline navigations.
  pub fn with_offline_page(mut self, path: impl Into<String>) -> Self {
    self.offline_page = path.into();
    self
  }

  pub fn rules(&self) -> &RouteRules {
    &self.rules
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  /// Route `request` through the strategy for its class.
  pub async fn handle(&self, request: Request) -> Result<Served, RouteError> {
    let class = self.rules.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "routing request");

    match class {
      ResourceClass::Tile => self.cache_first(TILES_PARTITION, request).await,
      ResourceClass::Api => self.network_first(DYNAMIC_PARTITION, request).await,
      ResourceClass::Static => self.stale_while_revalidate(STATIC_PARTITION, request).await,
      ResourceClass::Bypass => self.passthrough(request).await,
    }
  }

  /// Send `request` to the network untouched. Failures are returned as-is.
  pub async fn passthrough(&self, request: Request) -> Result<Served, RouteError> {
    Ok(Served::network(self.fetch_network(&request).await?))
  }

  /// One network call, bounded by the request's timeout or the default.
  pub async fn fetch_network(&self, request: &Request) -> Result<Response, TransportError> {
    let limit = request.timeout.unwrap_or(self.timeout);
    match tokio::time::timeout(limit, self.transport.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(TransportError::Timeout(limit)),
    }
  }

  /// Serve from the store when present and refresh in the background;
  /// otherwise fetch, store, and return.
  async fn cache_first(&self, partition: &'static str, request: Request) -> Result<Served, RouteError> {
    if let Some(cached) = self.cache.lookup(partition, &request).await? {
      let refresh = self.spawn_refresh(partition, request);
      return Ok(Served::cached(cached).with_revalidation(refresh));
    }

    let response = self.fetch_network(&request).await?;
    self.cache.save(partition, &request, &response).await?;
    Ok(Served::network(response))
  }

  /// Prefer the network; on transport failure serve the stored copy marked
  /// stale, or the offline payload when nothing is stored.
  async fn network_first(&self, partition: &'static str, request: Request) -> Result<Served, RouteError> {
    match self.fetch_network(&request).await {
      Ok(response) => {
        self.cache.save(partition, &request, &response).await?;
        Ok(Served::network(response))
      }
      Err(error) => {
        warn!(url = %request.url, error = %error, "network unavailable, falling back to store");
        match self.cache.lookup(partition, &request).await? {
          Some(cached) => Ok(Served::stale(cached)),
          None => Ok(Served::synthesized(offline_response(), ServedFrom::Offline)),
        }
      }
    }
  }

  /// Serve the stored copy immediately and update it for next time; wait
  /// for the network only when nothing is stored.
  async fn stale_while_revalidate(
    &self,
    partition: &'static str,
    request: Request,
  ) -> Result<Served, RouteError> {
    if let Some(cached) = self.cache.lookup(partition, &request).await? {
      let refresh = self.spawn_refresh(partition, request);
      return Ok(Served::cached(cached).with_revalidation(refresh));
    }

    match self.fetch_network(&request).await {
      Ok(response) => {
        self.cache.save(partition, &request, &response).await?;
        Ok(Served::network(response))
      }
      Err(error) if request.mode == RequestMode::Navigate => {
        info!(url = %request.url, error = %error, "serving offline document");
        self.offline_document().await
      }
      Err(error) => {
        debug!(url = %request.url, error = %error, "asset unavailable offline");
        Ok(Served::synthesized(
          Response::new(404, "Not found").with_header("content-type", "text/plain"),
          ServedFrom::NotFound,
        ))
      }
    }
  }

  async fn offline_document(&self) -> Result<Served, RouteError> {
    if let Ok(url) = self.rules.origin.join(&self.offline_page) {
      if let Some(cached) = self.cache.lookup(STATIC_PARTITION, &Request::get(url)).await? {
        return Ok(Served {
          source: ServedFrom::Fallback,
          ..Served::cached(cached)
        });
      }
    }

    Ok(Served::synthesized(
      Response::new(OFFLINE_STATUS, OFFLINE_DOCUMENT).with_header("content-type", "text/html; charset=utf-8"),
      ServedFrom::Fallback,
    ))
  }

  /// Detached refresh of one stored response. Runs to completion even if
  /// the caller drops the handle.
  fn spawn_refresh(&self, partition: &'static str, request: Request) -> JoinHandle<()> {
    let router = self.clone();
    tokio::spawn(async move {
      match router.fetch_network(&request).await {
        Ok(response) => {
          if let Err(e) = router.cache.save(partition, &request, &response).await {
            warn!(url = %request.url, error = %e, "failed to store refreshed response");
          } else {
            debug!(url = %request.url, partition, "refreshed cached response");
          }
        }
        Err(e) => debug!(url = %request.url, error = %e, "background refresh failed"),
      }
    })
  }
}

/// Deterministic response for "no network and nothing cached".
pub fn offline_response() -> Response {
  Response::new(OFFLINE_STATUS, OFFLINE_BODY).with_header("content-type", "application/json")
}
