//! Request, response, and served-result types.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

/// Whether a request loads a top-level document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation
  Navigate,
  /// Anything else (data, scripts, images, tiles)
  #[default]
  Subresource,
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
  /// Overrides the router's default network timeout
  pub timeout: Option<Duration>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::Subresource,
      timeout: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A navigation (document) GET.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A POST carrying a JSON body.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Self {
    Self {
      body: Some(body.to_string().into_bytes()),
      headers: vec![("content-type".into(), "application/json".into())],
      ..Self::new(Method::POST, url)
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// A response as received from the network or replayed from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn encode_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
  let encoded = String::deserialize(deserializer)?;
  STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// A response snapshot persisted under its request's canonical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
  pub key: String,
  pub url: String,
  pub response: Response,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub captured_at: DateTime<Utc>,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh from the network
  Network,
  /// From the store without consulting the network first
  Cache,
  /// From the store because the network failed
  Stale,
  /// Synthesized offline payload
  Offline,
  /// Offline fallback document for a navigation
  Fallback,
  /// Nothing cached and no network
  NotFound,
}

/// Result of routing a request.
#[derive(Debug)]
pub struct Served {
  pub response: Response,
  pub source: ServedFrom,
  /// Capture time of a response replayed from the store
  pub captured_at: Option<DateTime<Utc>>,
  /// Background refresh started by this request. Dropping the handle
  /// does not cancel the refresh.
  pub revalidation: Option<JoinHandle<()>>,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
      captured_at: None,
      revalidation: None,
    }
  }

  pub fn cached(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ServedFrom::Cache,
      captured_at: Some(cached.captured_at),
      revalidation: None,
    }
  }

  /// A cached response served because the network failed.
  pub fn stale(cached: CachedResponse) -> Self {
    Self {
      source: ServedFrom::Stale,
      ..Self::cached(cached)
    }
  }

  pub fn synthesized(response: Response, source: ServedFrom) -> Self {
    Self {
      response,
      source,
      captured_at: None,
      revalidation: None,
    }
  }

  pub fn with_revalidation(mut self, handle: JoinHandle<()>) -> Self {
    self.revalidation = Some(handle);
    self
  }

  pub fn is_stale(&self) -> bool {
    self.source == ServedFrom::Stale
  }

  /// Wait for the background refresh, if any, to settle.
  pub async fn settle(&mut self) {
    if let Some(handle) = self.revalidation.take() {
      let _ = handle.await;
    }
  }
}
