//! Scripted in-process transport for tests.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::client::Transport;
use super::types::{Request, Response};
use crate::error::TransportError;

/// Responds from a URL table. Unknown URLs get a 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
  responses: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<(Method, String)>>,
  bodies: Mutex<Vec<serde_json::Value>>,
  offline: AtomicBool,
  hanging: AtomicBool,
}

impl FakeTransport {
  pub fn respond(&self, url: &str, response: Response) {
    self.responses.lock().unwrap().insert(url.to_string(), response);
  }

  /// Make every request fail at the transport level.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Make every request stall far beyond any test timeout.
  pub fn set_hanging(&self, hanging: bool) {
    self.hanging.store(hanging, Ordering::SeqCst);
  }

  /// Make requests to `url` fail at the transport level.
  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().insert(url.to_string());
  }

  pub fn heal(&self, url: &str) {
    self.failing.lock().unwrap().remove(url);
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }

  /// JSON bodies of requests that reached the network, in send order.
  pub fn bodies(&self) -> Vec<serde_json::Value> {
    self.bodies.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push((request.method.clone(), url.clone()));

    if self.hanging.load(Ordering::SeqCst) {
      tokio::time::sleep(Duration::from_secs(60)).await;
    }
    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
      return Err(TransportError::Connect(format!("{url} unreachable")));
    }
    if let Some(body) = request.body.as_deref() {
      if let Ok(json) = serde_json::from_slice(body) {
        self.bodies.lock().unwrap().push(json);
      }
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
